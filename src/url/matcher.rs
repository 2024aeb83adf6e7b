/// Matches a string against a SQL `LIKE` pattern
///
/// `%` matches any run of characters (including none) and `_` matches exactly
/// one character. Matching is case-sensitive, which mirrors how the host
/// engine evaluates `LIKE` over URL columns. There is no escape character:
/// URLs containing literal `%` are percent-encoded anyway.
///
/// This is the pushdown filter for `where url LIKE ...`: candidate URLs are
/// dropped before they ever reach the work queue.
///
/// # Examples
///
/// ```
/// use trawl::url::matches_like;
///
/// assert!(matches_like("%/product/%", "https://shop.example/product/42"));
/// assert!(!matches_like("%/product/%", "https://shop.example/about"));
/// assert!(matches_like("https://example.com/page_", "https://example.com/page1"));
/// ```
pub fn matches_like(pattern: &str, text: &str) -> bool {
    let pat: Vec<char> = pattern.chars().collect();
    let txt: Vec<char> = text.chars().collect();

    // Iterative matcher with single-state backtracking over the most recent
    // `%`. Equivalent to the classic glob algorithm; O(len(pat) * len(txt))
    // worst case.
    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while t < txt.len() {
        if p < pat.len() && (pat[p] == '_' || pat[p] == txt[t]) {
            p += 1;
            t += 1;
        } else if p < pat.len() && pat[p] == '%' {
            star = Some((p, t));
            p += 1;
        } else if let Some((sp, st)) = star {
            p = sp + 1;
            t = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }

    while p < pat.len() && pat[p] == '%' {
        p += 1;
    }
    p == pat.len()
}
