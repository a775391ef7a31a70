//! Multi-page aggregation: many fetched pages in, one deep lore entry out.

use loreweave_llm::{Message, RoleClient};
use tracing::{info, warn};

use crate::crawler::{truncate_chars, FetchedPage};

/// Pages shorter than this carry too little signal to aggregate.
const MIN_PAGE_CHARS: usize = 200;
/// Per-source cap keeps one oversized page from starving the rest.
const PER_SOURCE_CHARS: usize = 6000;
/// Hard context ceiling across all sources.
const MAX_CONTEXT_CHARS: usize = 250_000;

const AGGREGATE_PROMPT: &str = "你是一个专业的知识库编辑。\n\
你需要根据以下 {count} 篇关于\"{keyword}\"的网页内容，撰写一份详尽的\"深度百科条目\"。\n\n\
【来源列表】\n{context}\n\n\
【任务要求】\n\
1. 综合统合：将不同来源的信息拼凑在一起，去除重复内容，解决冲突。\n\
2. 深度挖掘：保留所有细节（如具体数值、步骤、剧情转折、评价）。\n\
3. 结构清晰：使用 Markdown 格式，包含一级标题、二级标题和列表。\n\
4. 客观中立：像维基百科一样写作。\n\
5. 篇幅不限：内容越长越好，目标字数 1500+ 字。\n\
【深度百科条目】\n";

/// Usable sources: long enough pages, tagged and truncated.
pub fn build_corpus(pages: &[FetchedPage]) -> Vec<(String, String)> {
    pages
        .iter()
        .filter(|p| p.content.chars().count() > MIN_PAGE_CHARS)
        .map(|p| (p.domain.clone(), truncate_chars(&p.content, PER_SOURCE_CHARS)))
        .collect()
}

/// Assemble the tagged multi-source context, capped at the context ceiling.
pub fn render_context(corpus: &[(String, String)]) -> String {
    let mut context = String::new();
    for (i, (source, text)) in corpus.iter().enumerate() {
        context.push_str(&format!("=== 来源 {}: {} ===\n{}\n\n", i + 1, source, text));
    }
    if context.chars().count() > MAX_CONTEXT_CHARS {
        let mut truncated = truncate_chars(&context, MAX_CONTEXT_CHARS);
        truncated.push_str("\n...(截断)...");
        return truncated;
    }
    context
}

/// Ask the seeker LLM for one long-form entry. `None` abandons the task.
pub async fn aggregate(seeker: &RoleClient, keyword: &str, pages: &[FetchedPage]) -> Option<String> {
    let corpus = build_corpus(pages);
    if corpus.is_empty() {
        warn!(keyword, "no page long enough to aggregate");
        return None;
    }

    let context = render_context(&corpus);
    info!(
        keyword,
        sources = corpus.len(),
        chars = context.chars().count(),
        "synthesizing lore entry"
    );

    let prompt = AGGREGATE_PROMPT
        .replace("{count}", &corpus.len().to_string())
        .replace("{keyword}", keyword)
        .replace("{context}", &context);

    match seeker.generate(vec![Message::user(prompt)]).await {
        Ok(result) if !result.trim().is_empty() && !result.contains("NULL") => Some(result),
        Ok(_) => {
            warn!(keyword, "aggregator rejected the corpus");
            None
        }
        Err(e) => {
            warn!(keyword, err = %e, "aggregation LLM failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(domain: &str, content: String) -> FetchedPage {
        FetchedPage {
            title: "t".into(),
            url: format!("https://{domain}/x"),
            domain: domain.into(),
            content,
        }
    }

    #[test]
    fn corpus_drops_short_pages_and_caps_long_ones() {
        let pages = vec![
            page("short.com", "too short".into()),
            page("long.com", "長".repeat(7000)),
        ];
        let corpus = build_corpus(&pages);
        assert_eq!(corpus.len(), 1);
        assert_eq!(corpus[0].0, "long.com");
        assert_eq!(corpus[0].1.chars().count(), 6000);
    }

    #[test]
    fn context_tags_each_source() {
        let corpus = vec![
            ("a.com".to_string(), "alpha".to_string()),
            ("b.com".to_string(), "beta".to_string()),
        ];
        let ctx = render_context(&corpus);
        assert!(ctx.contains("=== 来源 1: a.com ==="));
        assert!(ctx.contains("=== 来源 2: b.com ==="));
        assert!(ctx.contains("beta"));
    }

    #[test]
    fn context_respects_hard_ceiling() {
        let corpus: Vec<(String, String)> = (0..60)
            .map(|i| (format!("s{i}.com"), "字".repeat(6000)))
            .collect();
        let ctx = render_context(&corpus);
        assert!(ctx.chars().count() <= MAX_CONTEXT_CHARS + 20);
        assert!(ctx.ends_with("...(截断)..."));
    }
}
