use std::fmt::Write;

const PERMESSAGE_DEFLATE: &str = "permessage-deflate";
const CLIENT_NO_CONTEXT_TAKEOVER: &str = "client_no_context_takeover";
const SERVER_NO_CONTEXT_TAKEOVER: &str = "server_no_context_takeover";
const CLIENT_MAX_WINDOW_BITS: &str = "client_max_window_bits";
const SERVER_MAX_WINDOW_BITS: &str = "server_max_window_bits";

const MIN_WINDOW_BITS: u8 = 8;
const MAX_WINDOW_BITS: u8 = 15;

/// The permessage-deflate parameters both sides agreed on.
///
/// The `*_no_context_takeover` flags dictate whether the compression context
/// is reset between messages: whoever compresses under a no-context-takeover
/// constraint must reset its compressor per message, and the opposite side
/// must reset its decompressor in lockstep. The window-bit parameters cap the
/// LZ77 sliding window of the respective direction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Extensions {
    pub client_no_context_takeover: bool,
    pub server_no_context_takeover: bool,
    pub client_max_window_bits: Option<u8>,
    pub server_max_window_bits: Option<u8>,
}

/// Parses one `Sec-WebSocket-Extensions` value into the parameters of its
/// first valid `permessage-deflate` entry. The header may carry several
/// comma-separated offers; entries with parameters we can't honor (window
/// bits outside 8..=15, or anything unparsable) are skipped rather than
/// silently accepted with different semantics.
pub(crate) fn parse_extensions(header_value: &str) -> Option<Extensions> {
    for offer in header_value.split(',') {
        let mut params = offer.split(';').map(str::trim);
        if !params
            .next()
            .is_some_and(|name| name.eq_ignore_ascii_case(PERMESSAGE_DEFLATE))
        {
            continue;
        }

        let mut extensions = Extensions::default();
        let mut valid = true;
        for param in params {
            let param = param.to_ascii_lowercase();
            let (name, value) = match param.split_once('=') {
                Some((name, value)) => (name.trim(), Some(value.trim().trim_matches('"'))),
                None => (param.as_str(), None),
            };
            match name {
                CLIENT_NO_CONTEXT_TAKEOVER if value.is_none() => {
                    extensions.client_no_context_takeover = true;
                }
                SERVER_NO_CONTEXT_TAKEOVER if value.is_none() => {
                    extensions.server_no_context_takeover = true;
                }
                // A bare client_max_window_bits means "any window works",
                // which is the same as the 15 maximum.
                CLIENT_MAX_WINDOW_BITS => match parse_window_bits(value.unwrap_or("15")) {
                    Some(bits) => extensions.client_max_window_bits = Some(bits),
                    None => valid = false,
                },
                SERVER_MAX_WINDOW_BITS => match parse_window_bits(value.unwrap_or("15")) {
                    Some(bits) => extensions.server_max_window_bits = Some(bits),
                    None => valid = false,
                },
                _ => valid = false,
            }
            if !valid {
                break;
            }
        }

        if valid {
            return Some(extensions);
        }
    }
    None
}

fn parse_window_bits(value: &str) -> Option<u8> {
    value
        .parse::<u8>()
        .ok()
        .filter(|bits| (MIN_WINDOW_BITS..=MAX_WINDOW_BITS).contains(bits))
}

/// Server-side negotiation: matches the client offer against whether deflate
/// was enabled in the server options and returns the agreed parameters, or
/// `None` when the extension header should be omitted from the response.
pub(crate) fn negotiate(offer_header: Option<&str>, deflate_enabled: bool) -> Option<Extensions> {
    if !deflate_enabled {
        return None;
    }
    let offer = parse_extensions(offer_header?)?;

    Some(Extensions {
        client_no_context_takeover: offer.client_no_context_takeover,
        // We always ask for a fresh context on our own direction.
        server_no_context_takeover: true,
        client_max_window_bits: Some(offer.client_max_window_bits.unwrap_or(MAX_WINDOW_BITS)),
        server_max_window_bits: None,
    })
}

/// `Sec-WebSocket-Extensions` value the server sends back once negotiation
/// succeeded.
pub(crate) fn response_header(extensions: &Extensions) -> String {
    let mut header = format!("{}; {}", PERMESSAGE_DEFLATE, SERVER_NO_CONTEXT_TAKEOVER);
    if extensions.client_no_context_takeover {
        let _ = write!(header, "; {}", CLIENT_NO_CONTEXT_TAKEOVER);
    }
    let _ = write!(
        header,
        "; {}={}",
        CLIENT_MAX_WINDOW_BITS,
        extensions.client_max_window_bits.unwrap_or(MAX_WINDOW_BITS)
    );
    header
}

/// `Sec-WebSocket-Extensions` value a client puts in its upgrade request when
/// it wants compression.
pub(crate) fn offer_header() -> String {
    format!(
        "{}; {}={}",
        PERMESSAGE_DEFLATE, CLIENT_MAX_WINDOW_BITS, MAX_WINDOW_BITS
    )
}
