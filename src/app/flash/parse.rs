use serde::Deserialize;
use tracing::debug;

/// One line of flashing-tool stdout. The tool emits a JSON object per line;
/// anything else is treated as chatter and skipped.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FlashEvent {
    Log {
        level: String,
        message: String,
    },
    Steps {
        total: u32,
    },
    FindingDevice,
    DeviceMode,
    Connecting,
    Connected,
    Bl2Boot,
    Resetting,
    StepChanged {
        step: u32,
        title: String,
    },
    FlashInfo {
        percent: f64,
        rate: f64,
        elapsed_ms: u64,
        eta_ms: u64,
    },
    Complete,
}

pub fn parse_flash_line(line: &str) -> Option<FlashEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str(trimmed) {
        Ok(event) => Some(event),
        Err(err) => {
            debug!(line = trimmed, error = %err, "unparseable flash tool line");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_step_events() {
        let event = parse_flash_line(r#"{"event":"step_changed","step":3,"title":"rootfs"}"#)
            .expect("event");
        assert_eq!(
            event,
            FlashEvent::StepChanged {
                step: 3,
                title: "rootfs".to_string()
            }
        );
    }

    #[test]
    fn parses_progress_events() {
        let event = parse_flash_line(
            r#"{"event":"flash_info","percent":42.5,"rate":12.0,"elapsed_ms":9000,"eta_ms":12000}"#,
        )
        .expect("event");
        match event {
            FlashEvent::FlashInfo { percent, eta_ms, .. } => {
                assert!((percent - 42.5).abs() < f64::EPSILON);
                assert_eq!(eta_ms, 12000);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn parses_unit_events() {
        assert_eq!(
            parse_flash_line(r#"{"event":"finding_device"}"#),
            Some(FlashEvent::FindingDevice)
        );
        assert_eq!(
            parse_flash_line(r#"{"event":"bl2_boot"}"#),
            Some(FlashEvent::Bl2Boot)
        );
    }

    #[test]
    fn skips_chatter() {
        assert_eq!(parse_flash_line(""), None);
        assert_eq!(parse_flash_line("starting up..."), None);
        assert_eq!(parse_flash_line(r#"{"event":"unknown_kind"}"#), None);
    }
}
