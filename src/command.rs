//! Command Synthesizer (C6): turns `(StreamSpec, EncoderChoice, device_path)`
//! into an argv list for the external encoder binary.

use crate::model::{EncoderChoice, FfmpegOption, StreamSpec};

pub const PROGRESS_FLAG: &str = "-progress";
const AUDIO_RESAMPLE_FILTER: &str = "aresample=async=1:min_hard_comp=0.100000:first_pts=0";

/// Build the argv for `spec`, given the selected encoder and a resolved
/// device path (ignored when `spec.custom_command` is set). `device_ready`
/// controls the test-mode overlay text.
pub fn synthesize(
    spec: &StreamSpec,
    choice: &EncoderChoice,
    device_path: Option<&str>,
    device_ready: bool,
    progress_endpoint: &str,
) -> Vec<String> {
    if let Some(custom) = &spec.custom_command {
        return custom.clone();
    }

    let mut argv: Vec<String> = vec!["ffmpeg".into(), "-hide_banner".into(), "-loglevel".into(), "warning".into()];
    argv.extend(choice.global_args.iter().cloned());

    if spec.test_mode {
        let overlay = if device_path.is_some() && !device_ready {
            "NO SIGNAL"
        } else {
            "TEST MODE"
        };
        argv.extend([
            "-f".into(),
            "lavfi".into(),
            "-i".into(),
            format!(
                "testsrc=size={}:rate={},drawtext=text='{}':fontsize=48:fontcolor=white:x=(w-text_w)/2:y=(h-text_h)/2",
                resolution_or_default(&spec.ffmpeg.resolution),
                spec.ffmpeg.fps,
                overlay,
            ),
        ]);
    } else {
        argv.extend(["-f".into(), spec.ffmpeg.input_format.clone()]);
        if !spec.ffmpeg.resolution.is_empty() {
            argv.extend(["-video_size".into(), spec.ffmpeg.resolution.clone()]);
        }
        argv.extend(["-framerate".into(), spec.ffmpeg.fps.to_string()]);
        argv.extend(["-i".into(), device_path.unwrap_or_default().to_string()]);

        if let Some(audio) = &spec.ffmpeg.audio_device {
            argv.extend(["-f".into(), "alsa".into(), "-i".into(), audio.clone()]);
            argv.extend(["-af".into(), AUDIO_RESAMPLE_FILTER.into()]);
        }
    }

    if !choice.video_filters.is_empty() {
        argv.extend(["-vf".into(), choice.video_filters.join(",")]);
    }

    argv.extend(["-c:v".into(), choice.name.clone()]);
    if let Some(preset) = &choice.preset {
        argv.extend(["-preset".into(), preset.clone()]);
    }

    let mode = match spec.ffmpeg.quality.mode {
        crate::model::QualityMode::Cbr => "-b:v",
        crate::model::QualityMode::Vbr => "-maxrate",
        crate::model::QualityMode::Cqp => "-qp",
    };
    argv.extend([mode.into(), format!("{}k", spec.ffmpeg.quality.bitrate_kbps)]);

    // Output params and options are emitted in a stable, documented order.
    for (k, v) in &choice.output_params {
        argv.push(format!("-{k}"));
        argv.push(v.clone());
    }
    let mut options: Vec<&FfmpegOption> = spec.ffmpeg.options.iter().collect();
    options.sort();
    for opt in options {
        argv.extend(option_flags(opt));
    }

    argv.extend([PROGRESS_FLAG.into(), progress_endpoint.to_string()]);
    argv.extend([
        "-f".into(),
        "mpegts".into(),
        format!(
            "srt://localhost:{}?streamid=publish:{}",
            media_hub_port(),
            spec.id
        ),
    ]);

    argv
}

fn option_flags(opt: &FfmpegOption) -> Vec<String> {
    match opt {
        FfmpegOption::LowLatency => vec!["-tune".into(), "zerolatency".into()],
        FfmpegOption::Deinterlace => vec!["-deinterlace".into()],
        FfmpegOption::Denoise => vec!["-vf".into(), "hqdn3d".into()],
        FfmpegOption::HardwareUpload => vec![],
    }
}

fn resolution_or_default(resolution: &str) -> String {
    if resolution.is_empty() {
        "1280x720".to_string()
    } else {
        resolution.to_string()
    }
}

fn media_hub_port() -> u16 {
    8554
}
