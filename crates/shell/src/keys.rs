//! Mapping of `is_input` payloads to terminal bytes.

/// Encode input for a running command. Named control keys become their control
/// byte; anything else is sent as a line.
pub fn encode_input(input: &str) -> Vec<u8> {
    match control_byte(input.trim()) {
        Some(byte) => vec![byte],
        None => format!("{input}\n").into_bytes(),
    }
}

fn control_byte(key: &str) -> Option<u8> {
    let rest = key.strip_prefix("C-").or_else(|| key.strip_prefix("c-"))?;
    let mut chars = rest.chars();
    let ch = chars.next()?;
    if chars.next().is_some() {
        return None;
    }
    match ch.to_ascii_lowercase() {
        c @ 'a'..='z' => Some(c as u8 - b'a' + 1),
        '\\' => Some(0x1c),
        '[' => Some(0x1b),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_keys() {
        assert_eq!(encode_input("C-c"), vec![0x03]);
        assert_eq!(encode_input("C-d"), vec![0x04]);
        assert_eq!(encode_input("C-z"), vec![0x1a]);
        assert_eq!(encode_input("C-\\"), vec![0x1c]);
        assert_eq!(encode_input(" C-C "), vec![0x03]);
    }

    #[test]
    fn test_plain_input_gets_newline() {
        assert_eq!(encode_input("y"), b"y\n".to_vec());
        assert_eq!(encode_input("C-cc"), b"C-cc\n".to_vec());
        assert_eq!(encode_input(""), b"\n".to_vec());
    }
}
