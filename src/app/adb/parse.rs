use std::collections::HashMap;

use regex::Regex;

use crate::app::models::AdbDevice;

/// Raw backlight range on the device. 1 is brightest, 245 is darkest.
pub const BRIGHTNESS_RAW_MAX: u32 = 245;

pub fn parse_devices(output: &str) -> Vec<AdbDevice> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter(|line| !line.trim_start().starts_with('*'))
        .filter(|line| !line.to_lowercase().contains("list of devices"))
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() < 2 {
                return None;
            }
            let adb_id = tokens[0].to_string();
            let state = tokens[1].to_string();
            let offline = state == "offline";
            Some(AdbDevice {
                adb_id,
                state,
                offline,
            })
        })
        .collect()
}

/// Extract the OS version from `/etc/superbird/version` contents.
pub fn parse_short_version(output: &str) -> Option<String> {
    let version_re = Regex::new(r"SHORT_VERSION\s+(\S+)").ok()?;
    version_re
        .captures(output)
        .map(|caps| caps[1].trim().to_string())
}

pub fn parse_supervisor_status(output: &str) -> HashMap<String, String> {
    let mut services = HashMap::new();
    for line in output.lines() {
        let mut tokens = line.trim().split_whitespace();
        let (Some(name), Some(status)) = (tokens.next(), tokens.next()) else {
            continue;
        };
        services.insert(name.to_string(), status.to_string());
    }
    services
}

/// The efuse MAC dump spans multiple lines; collapse it to one field.
pub fn parse_mac_bt(output: &str) -> String {
    output
        .lines()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn parse_brightness_raw(output: &str) -> Option<u32> {
    output
        .lines()
        .map(|line| line.trim())
        .find(|line| !line.is_empty())?
        .parse()
        .ok()
}

/// Percent (0-100) to raw backlight units. The device scale is inverted:
/// 245 is off, 1 is full brightness.
pub fn brightness_percent_to_raw(percent: u8) -> u32 {
    let percent = u32::from(percent.min(100));
    BRIGHTNESS_RAW_MAX - (percent * (BRIGHTNESS_RAW_MAX - 1) + 50) / 100
}

pub fn brightness_raw_to_percent(raw: u32) -> u8 {
    let raw = raw.min(BRIGHTNESS_RAW_MAX);
    let percent =
        ((BRIGHTNESS_RAW_MAX - raw) as f64 * 100.0 / BRIGHTNESS_RAW_MAX as f64).round() as u32;
    percent.min(100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_devices_output() {
        let output = "List of devices attached\ndev1\tdevice usb:1\ndev2\tdevice usb:2\n";
        let devices = parse_devices(output);
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].adb_id, "dev1");
        assert_eq!(devices[0].state, "device");
        assert!(!devices[0].offline);
        assert_eq!(devices[1].adb_id, "dev2");
    }

    #[test]
    fn marks_offline_devices() {
        let output = "List of devices attached\ndev1\toffline usb:1\n";
        let devices = parse_devices(output);
        assert_eq!(devices.len(), 1);
        assert!(devices[0].offline);
    }

    #[test]
    fn ignores_daemon_noise() {
        let output = "* daemon not running; starting now\n* daemon started successfully\nList of devices attached\ndev1\tdevice\n";
        let devices = parse_devices(output);
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].adb_id, "dev1");
    }

    #[test]
    fn parses_short_version() {
        let output = "IMAGE_TYPE userdebug\nSHORT_VERSION 8.2.5\nBUILD_ID 123\n";
        assert_eq!(parse_short_version(output).as_deref(), Some("8.2.5"));
        assert_eq!(parse_short_version("no version here"), None);
    }

    #[test]
    fn parses_supervisor_status() {
        let output = "chromium    RUNNING   pid 512, uptime 1:02:03\nbackend     STOPPED   Not started\n";
        let services = parse_supervisor_status(output);
        assert_eq!(services.get("chromium").map(String::as_str), Some("RUNNING"));
        assert_eq!(services.get("backend").map(String::as_str), Some("STOPPED"));
    }

    #[test]
    fn collapses_mac_bt_lines() {
        assert_eq!(parse_mac_bt("aa:bb:cc\n dd:ee:ff \n"), "aa:bb:cc dd:ee:ff");
    }

    #[test]
    fn brightness_round_trips_within_tolerance() {
        for percent in 0..=100u8 {
            let raw = brightness_percent_to_raw(percent);
            assert!((1..=BRIGHTNESS_RAW_MAX).contains(&raw), "raw {raw} out of range");
            let recovered = brightness_raw_to_percent(raw);
            let delta = (i16::from(recovered) - i16::from(percent)).abs();
            assert!(delta <= 1, "percent {percent} -> raw {raw} -> {recovered}");
        }
    }

    #[test]
    fn parses_brightness_raw() {
        assert_eq!(parse_brightness_raw("123\n"), Some(123));
        assert_eq!(parse_brightness_raw("\n 45 \n"), Some(45));
        assert_eq!(parse_brightness_raw("nope"), None);
    }
}
