use std::borrow::Cow;

/// Prefix every line that begins with `.` with an additional `.`
/// so that the data can be sent as a dot-terminated block.
pub fn apply_dot_stuffing(data: &[u8]) -> Cow<'_, [u8]> {
    if !data.starts_with(b".") && memchr::memmem::find(data, b"\n.").is_none() {
        return Cow::Borrowed(data);
    }

    let mut stuffed = Vec::with_capacity(data.len() + 8);
    if data.starts_with(b".") {
        stuffed.push(b'.');
    }
    let mut last_idx = 0;
    for i in memchr::memmem::find_iter(data, b"\n.") {
        stuffed.extend_from_slice(&data[last_idx..=i]);
        stuffed.push(b'.');
        last_idx = i + 1;
    }
    stuffed.extend_from_slice(&data[last_idx..]);
    Cow::Owned(stuffed)
}

/// Reverses [apply_dot_stuffing]: a `.` at the start of a line is dropped.
pub fn remove_dot_stuffing(data: &[u8]) -> Vec<u8> {
    let mut unstuffed = Vec::with_capacity(data.len());
    let mut line_start = true;
    for &b in data {
        if line_start && b == b'.' {
            line_start = false;
            continue;
        }
        line_start = b == b'\n';
        unstuffed.push(b);
    }
    unstuffed
}
