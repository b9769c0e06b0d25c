//! Hotplug message parsing (§6): null-separated `action@kobject\0KEY=VAL\0…`.

use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotplugEvent {
    pub action: String,
    pub subsystem: Option<String>,
    pub devname: Option<String>,
    pub devtype: Option<String>,
    pub devpath: Option<String>,
    pub env: BTreeMap<String, String>,
}

/// Parse one raw hotplug message. Returns `None` for malformed input (no
/// `action@kobject` header, or the header is empty).
pub fn parse_hotplug_message(raw: &[u8]) -> Option<HotplugEvent> {
    let mut parts = raw.split(|&b| b == 0).filter(|s| !s.is_empty());
    let header = std::str::from_utf8(parts.next()?).ok()?;
    let (action, _kobject) = header.split_once('@')?;
    if action.is_empty() {
        return None;
    }

    let mut env = BTreeMap::new();
    for field in parts {
        let field = std::str::from_utf8(field).ok()?;
        if let Some((key, value)) = field.split_once('=') {
            env.insert(key.to_string(), value.to_string());
        }
    }

    Some(HotplugEvent {
        action: action.to_string(),
        subsystem: env.get("SUBSYSTEM").cloned(),
        devname: env.get("DEVNAME").cloned(),
        devtype: env.get("DEVTYPE").cloned(),
        devpath: env.get("DEVPATH").cloned(),
        env,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(parts: &[&str]) -> Vec<u8> {
        let mut out = Vec::new();
        for p in parts {
            out.extend_from_slice(p.as_bytes());
            out.push(0);
        }
        out
    }

    #[test]
    fn parses_add_event() {
        let msg = raw(&[
            "add@/devices/pci0000:00/usb1/1-1",
            "ACTION=add",
            "SUBSYSTEM=video4linux",
            "DEVNAME=video0",
            "DEVPATH=/devices/pci0000:00/usb1/1-1",
        ]);
        let event = parse_hotplug_message(&msg).unwrap();
        assert_eq!(event.action, "add");
        assert_eq!(event.subsystem.as_deref(), Some("video4linux"));
        assert_eq!(event.devname.as_deref(), Some("video0"));
        assert_eq!(event.env.get("ACTION").unwrap(), "add");
    }

    #[test]
    fn parses_remove_event() {
        let msg = raw(&["remove@/devices/foo", "SUBSYSTEM=video4linux"]);
        let event = parse_hotplug_message(&msg).unwrap();
        assert_eq!(event.action, "remove");
    }

    #[test]
    fn rejects_missing_header_separator() {
        let msg = raw(&["addwithnokobject", "SUBSYSTEM=video4linux"]);
        assert!(parse_hotplug_message(&msg).is_none());
    }

    #[test]
    fn rejects_empty_action() {
        let msg = raw(&["@/devices/foo", "SUBSYSTEM=video4linux"]);
        assert!(parse_hotplug_message(&msg).is_none());
    }

    #[test]
    fn rejects_empty_input() {
        assert!(parse_hotplug_message(&[]).is_none());
    }

    #[test]
    fn ignores_env_fields_without_equals() {
        let msg = raw(&["add@/devices/foo", "garbage", "SUBSYSTEM=video4linux"]);
        let event = parse_hotplug_message(&msg).unwrap();
        assert_eq!(event.env.len(), 1);
    }
}
