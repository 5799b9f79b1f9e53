//! Pure SDP codec-parameter transform
//!
//! Adjusts `a=fmtp` parameters of named codecs before a description is
//! applied locally. Every line the transform does not own is preserved
//! byte for byte, including line endings, so foreign SDP survives a
//! round trip unchanged.

use crate::media::TrackKind;

/// Codecs the transform knows how to address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecName {
    /// Opus audio
    Opus,
}

impl CodecName {
    fn as_str(self) -> &'static str {
        match self {
            Self::Opus => "opus",
        }
    }
}

/// One codec-parameter adjustment
#[derive(Debug, Clone)]
pub struct CodecParamsMod {
    /// Which media sections to look in
    pub media_kind: TrackKind,
    /// Which codec's fmtp line to adjust
    pub codec: CodecName,
    /// Set `usedtx` (discontinuous transmission)
    pub enable_dtx: Option<bool>,
    /// Set `maxaveragebitrate`, in bits per second
    pub max_average_bitrate: Option<u32>,
}

/// The default adjustments: opus DTX always, plus a 12 kbps bitrate
/// cap for push-to-talk style calls
pub fn default_codec_mods(push_to_talk: bool) -> Vec<CodecParamsMod> {
    vec![CodecParamsMod {
        media_kind: TrackKind::Audio,
        codec: CodecName::Opus,
        enable_dtx: Some(true),
        max_average_bitrate: push_to_talk.then_some(12_000),
    }]
}

/// Apply codec-parameter mods to an SDP blob.
///
/// Returns the SDP unchanged when no mod matches.
pub fn apply_codec_mods(sdp: &str, mods: &[CodecParamsMod]) -> String {
    if mods.is_empty() {
        return sdp.to_owned();
    }

    // split keeping terminators so unrelated lines round-trip exactly
    let lines = split_keep_endings(sdp);
    let mut out: Vec<String> = Vec::with_capacity(lines.len() + mods.len());

    // payload types whose fmtp we still need to create, with the params
    let mut pending_fmtp: std::collections::HashMap<String, String> =
        std::collections::HashMap::new();

    // first pass per media section: learn the payload map, since
    // a=rtpmap lines always precede a=fmtp lines within a section
    let mut section_maps: Vec<std::collections::HashMap<String, String>> = Vec::new();
    {
        let mut current = std::collections::HashMap::new();
        let mut in_media = false;
        for line in &lines {
            let content = line.trim_end_matches(['\r', '\n']);
            if content.starts_with("m=") {
                if in_media {
                    section_maps.push(std::mem::take(&mut current));
                }
                in_media = true;
            } else if let Some((pt, codec)) = parse_rtpmap(content) {
                current.insert(pt, codec);
            }
        }
        if in_media {
            section_maps.push(current);
        }
    }

    let mut section_index = 0usize;
    for line in &lines {
        let content = line.trim_end_matches(['\r', '\n']);
        let ending = &line[content.len()..];

        if let Some(kind) = parse_media_line(content) {
            // flush any fmtp lines we still owe the previous section
            flush_pending(&mut out, &mut pending_fmtp, ending);
            // payload type -> codec name (lowercased) for this section
            let rtpmap = section_maps.get(section_index).cloned().unwrap_or_default();
            section_index += 1;
            pending_fmtp = plan_fmtp(kind, &rtpmap, mods);
            out.push(line.clone());
            continue;
        }

        if let Some((pt, _)) = parse_fmtp(content) {
            if let Some(extra) = pending_fmtp.remove(&pt) {
                out.push(format!("{content};{extra}{ending}"));
                continue;
            }
        }

        out.push(line.clone());

        // no existing fmtp for this payload: synthesize one right
        // after its rtpmap line
        if let Some((pt, _)) = parse_rtpmap(content) {
            if section_has_fmtp(&lines, &pt) {
                continue;
            }
            if let Some(extra) = pending_fmtp.remove(&pt) {
                out.push(format!("a=fmtp:{pt} {extra}{ending}"));
            }
        }
    }

    let last_ending = lines
        .last()
        .map(|l| l[l.trim_end_matches(['\r', '\n']).len()..].to_owned())
        .unwrap_or_default();
    flush_pending(&mut out, &mut pending_fmtp, &last_ending);

    out.concat()
}

fn flush_pending(
    out: &mut Vec<String>,
    pending: &mut std::collections::HashMap<String, String>,
    ending: &str,
) {
    let ending = if ending.is_empty() { "\r\n" } else { ending };
    let mut leftovers: Vec<_> = pending.drain().collect();
    leftovers.sort();
    for (pt, extra) in leftovers {
        out.push(format!("a=fmtp:{pt} {extra}{ending}"));
    }
}

fn plan_fmtp(
    section_kind: Option<TrackKind>,
    rtpmap: &std::collections::HashMap<String, String>,
    mods: &[CodecParamsMod],
) -> std::collections::HashMap<String, String> {
    let mut planned = std::collections::HashMap::new();
    let Some(kind) = section_kind else {
        return planned;
    };
    for m in mods.iter().filter(|m| m.media_kind == kind) {
        let mut params: Vec<String> = Vec::new();
        if let Some(dtx) = m.enable_dtx {
            params.push(format!("usedtx={}", u8::from(dtx)));
        }
        if let Some(rate) = m.max_average_bitrate {
            params.push(format!("maxaveragebitrate={rate}"));
        }
        if params.is_empty() {
            continue;
        }
        for (pt, codec) in rtpmap {
            if codec == m.codec.as_str() {
                planned.insert(pt.clone(), params.join(";"));
            }
        }
    }
    planned
}

fn split_keep_endings(sdp: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut start = 0;
    let bytes = sdp.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\n' {
            lines.push(sdp[start..=i].to_owned());
            start = i + 1;
        }
        i += 1;
    }
    if start < sdp.len() {
        lines.push(sdp[start..].to_owned());
    }
    lines
}

fn parse_media_line(line: &str) -> Option<Option<TrackKind>> {
    let rest = line.strip_prefix("m=")?;
    let kind = rest.split_whitespace().next().unwrap_or_default();
    Some(match kind {
        "audio" => Some(TrackKind::Audio),
        "video" => Some(TrackKind::Video),
        _ => None,
    })
}

/// Parse `a=rtpmap:<pt> <codec>/<clock>[/<channels>]`
fn parse_rtpmap(line: &str) -> Option<(String, String)> {
    let rest = line.strip_prefix("a=rtpmap:")?;
    let (pt, spec) = rest.split_once(' ')?;
    let codec = spec.split('/').next()?;
    Some((pt.to_owned(), codec.to_ascii_lowercase()))
}

/// Parse `a=fmtp:<pt> <params>`
fn parse_fmtp(line: &str) -> Option<(String, String)> {
    let rest = line.strip_prefix("a=fmtp:")?;
    let (pt, params) = rest.split_once(' ')?;
    Some((pt.to_owned(), params.to_owned()))
}

fn section_has_fmtp(lines: &[String], pt: &str) -> bool {
    // conservative: an fmtp anywhere for this payload type means we
    // edit in place rather than synthesizing a duplicate
    lines.iter().any(|l| {
        parse_fmtp(l.trim_end_matches(['\r', '\n']))
            .map(|(p, _)| p == pt)
            .unwrap_or(false)
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const OFFER: &str = "v=0\r\n\
        o=- 1 1 IN IP4 127.0.0.1\r\n\
        s=-\r\n\
        m=audio 9 UDP/TLS/RTP/SAVPF 111 103\r\n\
        a=rtpmap:111 opus/48000/2\r\n\
        a=fmtp:111 minptime=10;useinbandfec=1\r\n\
        a=rtpmap:103 ISAC/16000\r\n\
        m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
        a=rtpmap:96 VP8/90000\r\n";

    #[test]
    fn test_appends_to_existing_fmtp() {
        let out = apply_codec_mods(OFFER, &default_codec_mods(false));
        assert!(out.contains("a=fmtp:111 minptime=10;useinbandfec=1;usedtx=1\r\n"));
        // other codec untouched
        assert!(out.contains("a=rtpmap:103 ISAC/16000\r\n"));
    }

    #[test]
    fn test_push_to_talk_caps_bitrate() {
        let out = apply_codec_mods(OFFER, &default_codec_mods(true));
        assert!(out
            .contains("a=fmtp:111 minptime=10;useinbandfec=1;usedtx=1;maxaveragebitrate=12000"));
    }

    #[test]
    fn test_synthesizes_fmtp_when_absent() {
        let sdp = "m=audio 9 RTP/AVP 111\r\na=rtpmap:111 opus/48000/2\r\n";
        let out = apply_codec_mods(sdp, &default_codec_mods(false));
        assert_eq!(
            out,
            "m=audio 9 RTP/AVP 111\r\na=rtpmap:111 opus/48000/2\r\na=fmtp:111 usedtx=1\r\n"
        );
    }

    #[test]
    fn test_video_sections_untouched() {
        let out = apply_codec_mods(OFFER, &default_codec_mods(false));
        assert!(out.contains("a=rtpmap:96 VP8/90000\r\n"));
        assert!(!out.contains("a=fmtp:96"));
    }

    #[test]
    fn test_no_mods_is_identity() {
        assert_eq!(apply_codec_mods(OFFER, &[]), OFFER);
    }

    #[test]
    fn test_foreign_lines_roundtrip() {
        let sdp = "v=0\no=alice 1 1 IN IP4 0.0.0.0\nm=application 9 DTLS/SCTP 5000\n";
        assert_eq!(apply_codec_mods(sdp, &default_codec_mods(false)), sdp);
    }

    #[test]
    fn test_case_insensitive_codec_match() {
        let sdp = "m=audio 9 RTP/AVP 111\r\na=rtpmap:111 OPUS/48000/2\r\n";
        let out = apply_codec_mods(sdp, &default_codec_mods(false));
        assert!(out.contains("a=fmtp:111 usedtx=1"));
    }
}
