//! Carrier media-stream frames: newline-less JSON envelopes tagged by
//! `event`, with base64 µ-law media payloads.

use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum StreamFrame {
    Connected,
    Start {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        start: StartInfo,
    },
    Media {
        media: MediaInfo,
    },
    Stop,
    Mark {
        mark: MarkInfo,
    },
}

#[derive(Debug, Deserialize)]
pub struct StartInfo {
    #[serde(rename = "callSid")]
    pub call_sid: String,
    #[serde(default, rename = "accountSid")]
    pub account_sid: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MediaInfo {
    /// Base64 µ-law at 8kHz mono.
    pub payload: String,
    #[serde(default)]
    pub track: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MarkInfo {
    pub name: String,
}

pub fn media_frame(stream_sid: &str, payload_b64: &str) -> String {
    json!({
        "event": "media",
        "streamSid": stream_sid,
        "media": {"payload": payload_b64},
    })
    .to_string()
}

/// Named marks come back from the carrier once everything queued before
/// them has been played to the human.
pub fn mark_frame(stream_sid: &str, name: &str) -> String {
    json!({
        "event": "mark",
        "streamSid": stream_sid,
        "mark": {"name": name},
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_connected_and_start() {
        let connected = r#"{"event":"connected","protocol":"Call","version":"1.0.0"}"#;
        assert!(matches!(
            serde_json::from_str::<StreamFrame>(connected).unwrap(),
            StreamFrame::Connected
        ));

        let start = r#"{
            "event": "start",
            "sequenceNumber": "1",
            "streamSid": "MZ123",
            "start": {
                "streamSid": "MZ123",
                "accountSid": "AC999",
                "callSid": "CA555",
                "tracks": ["inbound"],
                "mediaFormat": {"encoding": "audio/x-mulaw", "sampleRate": 8000, "channels": 1}
            }
        }"#;
        match serde_json::from_str::<StreamFrame>(start).unwrap() {
            StreamFrame::Start { stream_sid, start } => {
                assert_eq!(stream_sid, "MZ123");
                assert_eq!(start.call_sid, "CA555");
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_parse_media_and_mark() {
        let media = r#"{"event":"media","streamSid":"MZ123","media":{"track":"inbound","chunk":"2","timestamp":"20","payload":"AAEC"}}"#;
        match serde_json::from_str::<StreamFrame>(media).unwrap() {
            StreamFrame::Media { media } => assert_eq!(media.payload, "AAEC"),
            other => panic!("unexpected frame: {:?}", other),
        }

        let mark = r#"{"event":"mark","streamSid":"MZ123","mark":{"name":"hangup"}}"#;
        match serde_json::from_str::<StreamFrame>(mark).unwrap() {
            StreamFrame::Mark { mark } => assert_eq!(mark.name, "hangup"),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_outbound_frames_shape() {
        let media: serde_json::Value =
            serde_json::from_str(&media_frame("MZ1", "AAEC")).unwrap();
        assert_eq!(media["event"], "media");
        assert_eq!(media["streamSid"], "MZ1");
        assert_eq!(media["media"]["payload"], "AAEC");

        let mark: serde_json::Value = serde_json::from_str(&mark_frame("MZ1", "dtmf")).unwrap();
        assert_eq!(mark["event"], "mark");
        assert_eq!(mark["mark"]["name"], "dtmf");
    }
}
