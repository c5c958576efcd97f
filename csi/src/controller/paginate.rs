use tonic::{Code, Status};

/// Offset encoded in a starting token; an empty token starts at 0.
pub fn parse_token(token: &str) -> Result<usize, Status> {
    if token.is_empty() {
        return Ok(0);
    }
    token.parse::<usize>().map_err(|_| {
        failure!(Code::Aborted, "Invalid starting token {}", token)
    })
}

pub fn parse_max_entries(max_entries: i32) -> Result<usize, Status> {
    if max_entries < 0 {
        return Err(failure!(
            Code::InvalidArgument,
            "max_entries can not be negative: {}",
            max_entries
        ));
    }
    Ok(max_entries as usize)
}

/// Page of `items` starting at `start` holding at most `size` entries
/// (everything when `size` is 0), and the offset of the next page, 0 once
/// the end is reached.
pub fn paginate<T>(items: &[T], start: usize, size: usize) -> (&[T], usize) {
    if start >= items.len() {
        return (&[], 0);
    }
    if size == 0 {
        return (&items[start ..], 0);
    }
    let end = start.saturating_add(size);
    if end < items.len() {
        (&items[start .. end], end)
    } else {
        (&items[start ..], 0)
    }
}
