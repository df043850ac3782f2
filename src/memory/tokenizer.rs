//! 分词与词法相关度
//!
//! 中英文混合文本：CJK 段交给 jieba-rs（搜索引擎模式），其余按非字母数字字符切分。
//! 相关度只看词面重叠，不做向量检索。

use std::collections::HashSet;
use std::sync::OnceLock;

use jieba_rs::Jieba;

static JIEBA: OnceLock<Jieba> = OnceLock::new();

fn jieba() -> &'static Jieba {
    JIEBA.get_or_init(Jieba::new)
}

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}' |
        '\u{3400}'..='\u{4DBF}' |
        '\u{F900}'..='\u{FAFF}' |
        '\u{3040}'..='\u{309F}' |
        '\u{30A0}'..='\u{30FF}'
    )
}

pub fn contains_cjk(text: &str) -> bool {
    text.chars().any(is_cjk)
}

/// 小写化的词序列；单字符拉丁词被丢弃
pub fn tokenize(text: &str) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }

    if contains_cjk(text) {
        jieba()
            .cut_for_search(text, true)
            .into_iter()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| s.chars().count() > 1 || s.chars().next().is_some_and(is_cjk))
            .filter(|s| s.chars().any(|c| c.is_alphanumeric()))
            .collect()
    } else {
        text.split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|s| s.len() > 1)
            .map(|s| s.to_lowercase())
            .collect()
    }
}

/// 查询词被文本覆盖的比例，较长的词权重更高；结果在 [0, 1]
pub fn relevance(query: &[String], text: &[String]) -> f32 {
    if query.is_empty() || text.is_empty() {
        return 0.0;
    }
    let query: HashSet<&String> = query.iter().collect();
    let text: HashSet<&String> = text.iter().collect();

    let weight = |t: &&String| (t.chars().count() as f32).sqrt();
    let total: f32 = query.iter().map(weight).sum();
    if total <= 0.0 {
        return 0.0;
    }
    let hit: f32 = query.intersection(&text).map(weight).sum();
    (hit / total).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_english_strips_punctuation() {
        let tokens = tokenize("Login form: validate e-mail, a password!");
        assert!(tokens.contains(&"login".to_string()));
        assert!(tokens.contains(&"password".to_string()));
        assert!(!tokens.iter().any(|t| t == "a"));
    }

    #[test]
    fn test_tokenize_chinese() {
        let tokens = tokenize("实现用户登录功能");
        assert!(!tokens.is_empty());
        assert!(tokens.iter().any(|t| t.contains("登录") || t.contains("用户")));
    }

    #[test]
    fn test_relevance_bounds() {
        let q = tokenize("user login form");
        assert!((relevance(&q, &q) - 1.0).abs() < 1e-6);
        assert_eq!(relevance(&q, &tokenize("database migration")), 0.0);
        let partial = relevance(&q, &tokenize("the login page"));
        assert!(partial > 0.0 && partial < 1.0);
        assert_eq!(relevance(&[], &q), 0.0);
    }
}
