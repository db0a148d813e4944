/// Remote settings changes received over MQTT.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlMessage {
    SetPassiveMode(bool),
    SetSuspended(bool),
}

impl ControlMessage {
    /// Parses a message from its topic suffix (`set/passive_mode`,
    /// `set/suspended`) and a `true`/`false` payload.
    pub fn parse(topic: &str, payload: &[u8]) -> Option<Self> {
        let value = match std::str::from_utf8(payload).ok()?.trim() {
            v if v.eq_ignore_ascii_case("true") || v == "1" || v.eq_ignore_ascii_case("on") => true,
            v if v.eq_ignore_ascii_case("false") || v == "0" || v.eq_ignore_ascii_case("off") => {
                false
            }
            _ => return None,
        };
        match topic {
            t if t.ends_with("/set/passive_mode") => Some(ControlMessage::SetPassiveMode(value)),
            t if t.ends_with("/set/suspended") => Some(ControlMessage::SetSuspended(value)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!(
            ControlMessage::parse("proximity/set/passive_mode", b"true"),
            Some(ControlMessage::SetPassiveMode(true))
        );
        assert_eq!(
            ControlMessage::parse("proximity/set/suspended", b" OFF\n"),
            Some(ControlMessage::SetSuspended(false))
        );
        assert_eq!(ControlMessage::parse("proximity/set/suspended", b"maybe"), None);
        assert_eq!(ControlMessage::parse("proximity/scan/arrive", b"true"), None);
    }
}
