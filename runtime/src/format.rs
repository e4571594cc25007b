/// Split a long response into chunks under the transport's message limit,
/// breaking on newlines to preserve formatting. A single line longer than
/// the limit becomes its own (oversized) chunk; transports that hard-reject
/// it will surface that through the outbox retry path.
pub fn split_for_transport(response: &str, max_length: usize) -> Vec<String> {
    if response.len() <= max_length {
        return vec![response.to_string()];
    }

    let mut messages = Vec::new();
    let mut current = String::new();
    for line in response.split('\n') {
        if !current.is_empty() && current.len() + line.len() + 1 > max_length {
            messages.push(std::mem::take(&mut current));
        }
        if current.is_empty() {
            current.push_str(line);
        } else {
            current.push('\n');
            current.push_str(line);
        }
    }
    if !current.is_empty() {
        messages.push(current);
    }
    messages
}
