//! Company-name normalisation.
//!
//! One canonical form is used everywhere a name acts as a key: cache lookups
//! on `customer_name`, the customer half of `plan_customer`, queue
//! deduplication, and temp-id hashing. The same raw-name variants (trailing
//! whitespace, bracket style, status markers, full-width characters) must all
//! collapse to the same key, so the transformation order below is load-bearing
//! and must not be reordered.

use once_cell::sync::Lazy;
use regex::Regex;

/// Company status markers stripped from names before keying. Matched
/// longest-first so that e.g. `已转出` is never half-consumed as `转出`.
const STATUS_MARKERS: [&str; 33] = [
    "已转出",
    "待转出",
    "终止",
    "转出",
    "保留",
    "暂停",
    "注销",
    "清算",
    "解散",
    "吊销",
    "撤销",
    "停业",
    "歇业",
    "关闭",
    "迁出",
    "迁入",
    "变更",
    "合并",
    "分立",
    "破产",
    "重整",
    "托管",
    "接管",
    "整顿",
    "清盘",
    "退出",
    "终结",
    "结束",
    "完结",
    "已作废",
    "作废",
    "存量",
    "原",
];

static MARKER_ALTERNATION: Lazy<String> = Lazy::new(|| {
    let mut markers = STATUS_MARKERS.to_vec();
    markers.sort_by_key(|marker| std::cmp::Reverse(marker.chars().count()));
    markers
        .iter()
        .map(|marker| regex::escape(marker))
        .collect::<Vec<_>>()
        .join("|")
});

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("static pattern"));

// Trailing business suffixes: (团托) in either bracket style, latin or
// numeric codes after a dash, and the -养老 / -福利 product suffixes.
static BUSINESS_SUFFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:\(团托\)|（团托）|-[A-Za-z][A-Za-z0-9]*|-\d+|-养老|-福利)$")
        .expect("static pattern")
});

static MARKER_AT_START: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"^[\(（]?(?:{})[\)）]?-?", &*MARKER_ALTERNATION)).expect("static pattern")
});

static MARKER_AT_END: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"[-\(（](?:{})[\)）]?$", &*MARKER_ALTERNATION)).expect("static pattern")
});

static MARKER_IN_TRAILING_BRACKETS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"[\(（](?:{})[\)）]$", &*MARKER_ALTERNATION)).expect("static pattern")
});

static TRAILING_PUNCTUATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[-\.。]+$").expect("static pattern"));

static TRAILING_EMPTY_BRACKETS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"（）$").expect("static pattern"));

/// Normalise a raw company name into its canonical keyed form.
///
/// Returns the empty string for empty input. Never fails.
pub fn normalize_company_name(name: &str) -> String {
    if name.is_empty() {
        return String::new();
    }

    // 1. Remove all whitespace.
    let mut name = WHITESPACE.replace_all(name, "").into_owned();

    // 2. Business-specific patterns: the subsidiary phrase anywhere, then one
    //    trailing suffix.
    name = name.replace("及下属子企业", "");
    name = BUSINESS_SUFFIX.replace(&name, "").into_owned();

    // 3. Status markers at the start, at the end, and inside trailing
    //    brackets. Names can stack several markers ("公司-保留-终止"), so each
    //    anchored pattern is applied until it stops matching.
    name = strip_repeatedly(&MARKER_AT_START, name);
    name = strip_repeatedly(&MARKER_AT_END, name);
    name = strip_repeatedly(&MARKER_IN_TRAILING_BRACKETS, name);

    // 4. Full-width to half-width for the fixed-width latin block.
    name = name
        .chars()
        .map(|c| match c as u32 {
            0xFF01..=0xFF5E => char::from_u32(c as u32 - 0xFEE0).unwrap_or(c),
            _ => c,
        })
        .collect();

    // 5. Canonical Chinese brackets.
    name = name.replace('(', "（").replace(')', "）");

    // 6. Trailing punctuation and a leftover empty bracket pair.
    name = TRAILING_PUNCTUATION.replace(&name, "").into_owned();
    name = TRAILING_EMPTY_BRACKETS.replace(&name, "").into_owned();

    // 7. Lower-case for hash stability.
    name.to_lowercase()
}

fn strip_repeatedly(pattern: &Regex, mut name: String) -> String {
    loop {
        let stripped = pattern.replace(&name, "");
        if stripped == name {
            return name;
        }
        name = stripped.into_owned();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("", "")]
    #[case("中国平安", "中国平安")]
    #[case("  中国平安  ", "中国平安")]
    #[case("中国 平 安", "中国平安")]
    #[case("中国平安-已转出", "中国平安")]
    #[case("已转出-中国平安", "中国平安")]
    #[case("中国平安（已转出）", "中国平安")]
    #[case("中国平安(已转出)", "中国平安")]
    #[case("中国平安(集团)", "中国平安（集团）")]
    #[case("中国平安及下属子企业", "中国平安")]
    #[case("中国平安(团托)", "中国平安")]
    #[case("中国平安-BSU280", "中国平安")]
    #[case("中国平安-ChinaHolding", "中国平安")]
    #[case("中国平安-123", "中国平安")]
    #[case("中国平安-养老", "中国平安")]
    #[case("中国平安-福利", "中国平安")]
    #[case("中国平安-", "中国平安")]
    #[case("中国平安。", "中国平安")]
    #[case("中国平安（）", "中国平安")]
    #[case("ＡＢＣ公司", "abc公司")]
    #[case("Ping An Group", "pingangroup")]
    #[case("（原）中国平安", "中国平安")]
    #[case("测试企业-保留-终止", "测试企业")]
    fn normalizes_known_variants(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(normalize_company_name(input), expected);
    }

    #[rstest]
    #[case("中国平安-已转出")]
    #[case("ＡＢＣ公司(团托)")]
    #[case("  存量-测试企业（清算）  ")]
    #[case("平安养老保险股份有限公司")]
    fn normalization_is_idempotent(#[case] input: &str) {
        let once = normalize_company_name(input);
        assert_eq!(normalize_company_name(&once), once);
    }

    #[test]
    fn longest_marker_wins_over_its_suffix() {
        // `已转出` must be consumed whole, not as `转出` leaving `已` behind.
        assert_eq!(normalize_company_name("测试企业-已转出"), "测试企业");
    }

    #[test]
    fn marker_inside_the_name_is_preserved() {
        // Markers are only stripped at the edges; a company legitimately named
        // around one keeps it.
        assert_eq!(
            normalize_company_name("托管银行股份有限公司"),
            "托管银行股份有限公司"
        );
    }
}
