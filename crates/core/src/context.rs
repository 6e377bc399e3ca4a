use crate::models::RetrievalHit;

/// Greedy prefix fill: appends passages (each followed by `separator`) in the
/// given order and stops before the first passage whose text would push the
/// accumulated length past `max_context_chars`. Lengths are in chars.
pub fn assemble_context(hits: &[RetrievalHit], max_context_chars: usize, separator: &str) -> String {
    let separator_len = separator.chars().count();
    let mut context = String::new();
    let mut used = 0usize;

    for hit in hits {
        let text_len = hit.passage.text.chars().count();
        if used + text_len > max_context_chars {
            break;
        }
        context.push_str(&hit.passage.text);
        context.push_str(separator);
        used += text_len + separator_len;
    }

    context
}
