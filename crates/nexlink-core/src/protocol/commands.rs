//! Command string builders
//!
//! Pure formatters producing the ASCII instruction strings the device
//! understands, with input validation. They carry no protocol state and are
//! consumed unchanged by the command encoder.

use super::ProtocolError;

fn validate_name(kind: &str, name: &str) -> Result<(), ProtocolError> {
    if name.is_empty() {
        return Err(ProtocolError::InvalidCommand(format!("{kind} is empty")));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
    {
        return Err(ProtocolError::InvalidCommand(format!(
            "{kind} {name:?} contains invalid characters"
        )));
    }
    Ok(())
}

/// Navigate to a page by index
pub fn page(index: u8) -> String {
    format!("page {index}")
}

/// Navigate to a page by name
pub fn page_named(name: &str) -> Result<String, ProtocolError> {
    validate_name("page name", name)?;
    Ok(format!("page {name}"))
}

/// Set backlight brightness for the current session (percent)
pub fn brightness(percent: u8) -> Result<String, ProtocolError> {
    if percent > 100 {
        return Err(ProtocolError::InvalidCommand(format!(
            "brightness {percent} exceeds 100%"
        )));
    }
    Ok(format!("dim={percent}"))
}

/// Set the power-on default backlight brightness (percent)
pub fn default_brightness(percent: u8) -> Result<String, ProtocolError> {
    if percent > 100 {
        return Err(ProtocolError::InvalidCommand(format!(
            "brightness {percent} exceeds 100%"
        )));
    }
    Ok(format!("dims={percent}"))
}

/// Enter or leave sleep mode
pub fn sleep(enabled: bool) -> String {
    format!("sleep={}", u8::from(enabled))
}

/// Seconds of touch inactivity before auto-sleep; 0 disables
pub fn touch_sleep_timer(seconds: u16) -> String {
    format!("thsp={seconds}")
}

/// Seconds of serial inactivity before auto-sleep; 0 disables
pub fn serial_sleep_timer(seconds: u16) -> String {
    format!("ussp={seconds}")
}

/// Whether touching the screen wakes the device from sleep
pub fn wake_on_touch(enabled: bool) -> String {
    format!("thup={}", u8::from(enabled))
}

/// How chatty the device is about command execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseLevel {
    /// Never report execution results
    None = 0,
    /// Report successes only
    OnSuccess = 1,
    /// Report failures only
    OnFailure = 2,
    /// Report every command
    Always = 3,
}

/// Set the execution-result response level
pub fn response_level(level: ResponseLevel) -> String {
    format!("bkcmd={}", level as u8)
}

/// Disable (0) or set the device's two-byte address
pub fn set_address(address: u16) -> Result<String, ProtocolError> {
    if address != 0 && !(256..=2815).contains(&address) {
        return Err(ProtocolError::InvalidCommand(format!(
            "address {address} outside 256..=2815"
        )));
    }
    Ok(format!("addr={address}"))
}

/// Assign a text attribute, e.g. `t0.txt="hello"`
pub fn set_text(attribute: &str, text: &str) -> Result<String, ProtocolError> {
    validate_name("attribute", attribute)?;
    if text.contains('"') || text.bytes().any(|b| b == 0xFF) {
        return Err(ProtocolError::InvalidCommand(
            "text may not contain double quotes or 0xFF bytes".to_string(),
        ));
    }
    Ok(format!("{attribute}=\"{text}\""))
}

/// Request an attribute's value; the device answers with a string (0x70) or
/// numeric (0x71) frame
pub fn get(attribute: &str) -> Result<String, ProtocolError> {
    validate_name("attribute", attribute)?;
    Ok(format!("get {attribute}"))
}

/// Reboot the device
pub fn reset() -> String {
    "rest".to_string()
}

/// Pack 8-bit RGB into the RGB565 value display attributes expect
pub fn rgb565(r: u8, g: u8, b: u8) -> u16 {
    ((r as u16 & 0xF8) << 8) | ((g as u16 & 0xFC) << 3) | (b as u16 >> 3)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_page_commands() {
        assert_eq!(page(3), "page 3");
        assert_eq!(page_named("main").unwrap(), "page main");
        assert!(page_named("no spaces").is_err());
        assert!(page_named("").is_err());
    }

    #[test]
    fn test_brightness_bounds() {
        assert_eq!(brightness(50).unwrap(), "dim=50");
        assert_eq!(default_brightness(100).unwrap(), "dims=100");
        assert!(brightness(101).is_err());
    }

    #[test]
    fn test_sleep_commands() {
        assert_eq!(sleep(true), "sleep=1");
        assert_eq!(sleep(false), "sleep=0");
        assert_eq!(touch_sleep_timer(0), "thsp=0");
        assert_eq!(serial_sleep_timer(30), "ussp=30");
        assert_eq!(wake_on_touch(true), "thup=1");
    }

    #[test]
    fn test_response_level() {
        assert_eq!(response_level(ResponseLevel::OnFailure), "bkcmd=2");
    }

    #[test]
    fn test_set_address() {
        assert_eq!(set_address(0).unwrap(), "addr=0");
        assert_eq!(set_address(300).unwrap(), "addr=300");
        assert!(set_address(100).is_err());
        assert!(set_address(3000).is_err());
    }

    #[test]
    fn test_set_text_validation() {
        assert_eq!(set_text("t0.txt", "hello").unwrap(), "t0.txt=\"hello\"");
        assert!(set_text("t0.txt", "say \"hi\"").is_err());
        assert!(set_text("bad name", "x").is_err());
    }

    #[test]
    fn test_get() {
        assert_eq!(get("t0.txt").unwrap(), "get t0.txt");
    }

    #[test]
    fn test_rgb565() {
        assert_eq!(rgb565(255, 255, 255), 0xFFFF);
        assert_eq!(rgb565(0, 0, 0), 0x0000);
        assert_eq!(rgb565(255, 0, 0), 0xF800);
        assert_eq!(rgb565(0, 255, 0), 0x07E0);
        assert_eq!(rgb565(0, 0, 255), 0x001F);
    }
}
