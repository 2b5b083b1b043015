//! Result shortening for session logs
//!
//! Bodies longer than `HEAD_BYTES + TAIL_BYTES` are logged as
//! `head…[N bytes omitted]…tail`. Cuts land on char boundaries, and the
//! original length can be recovered with [`logged_len`].

pub const HEAD_BYTES: usize = 50;
pub const TAIL_BYTES: usize = 50;

const OPEN: &str = "…[";
const CLOSE: &str = " bytes omitted]…";

pub fn truncate_for_log(body: &str) -> String {
    if body.len() <= HEAD_BYTES + TAIL_BYTES {
        return body.to_string();
    }

    let mut head_end = HEAD_BYTES;
    while !body.is_char_boundary(head_end) {
        head_end -= 1;
    }
    let mut tail_start = body.len() - TAIL_BYTES;
    while !body.is_char_boundary(tail_start) {
        tail_start += 1;
    }

    let omitted = tail_start - head_end;
    format!(
        "{}{}{}{}{}",
        &body[..head_end],
        OPEN,
        omitted,
        CLOSE,
        &body[tail_start..]
    )
}

/// Length in bytes of the body a logged result was made from
pub fn logged_len(logged: &str) -> usize {
    // The head is at most HEAD_BYTES long and may itself contain the marker
    for (start, _) in logged.match_indices(OPEN) {
        if start > HEAD_BYTES {
            break;
        }
        let rest = &logged[start + OPEN.len()..];
        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        if digits == 0 || !rest[digits..].starts_with(CLOSE) {
            continue;
        }
        let Ok(omitted) = rest[..digits].parse::<usize>() else {
            continue;
        };
        let tail = &rest[digits + CLOSE.len()..];
        if tail.len() > TAIL_BYTES {
            continue;
        }
        return start + omitted + tail.len();
    }
    logged.len()
}
