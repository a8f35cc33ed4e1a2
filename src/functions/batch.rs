use crate::schema::{InputRow, RowResult};
use crate::services::{ModelInvoker, ResponseCache, cache_key};
use std::sync::Arc;

pub const DEFAULT_BATCH_SIZE: usize = 12;

/// Everything a chunk needs to reach the model, resolved once per job run.
pub struct BatchContext {
    pub invoker: Arc<dyn ModelInvoker>,
    pub cache: Arc<dyn ResponseCache>,
    pub model: String,
    pub instructions: String,
}

/// Fold a user-supplied prompt template into the instruction block. The
/// `{input}` placeholder is stripped; the actual inputs always travel as
/// the numbered list.
pub fn fold_template(instructions: &str, template: Option<&str>) -> String {
    match template {
        Some(template) => {
            let folded = template.replace("{input}", "");
            let folded = folded.trim();
            if folded.is_empty() {
                instructions.to_string()
            } else {
                format!("{instructions}\n\n{folded}")
            }
        }
        None => instructions.to_string(),
    }
}

/// `"1. <input>\n2. <input>\n..."`; numbering is positional within the
/// chunk, independent of row indices.
pub fn render_numbered_prompt(rows: &[InputRow]) -> String {
    let mut prompt = String::new();
    for (i, row) in rows.iter().enumerate() {
        prompt.push_str(&format!("{}. {}\n", i + 1, row.input));
    }
    prompt
}

/// Leading numeric item marker: `"<n>. "`, `"<n>) "` or `"<n>: "`.
fn leading_marker(line: &str) -> Option<(usize, &str)> {
    let digits_end = line
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(line.len());
    if digits_end == 0 {
        return None;
    }
    let n: usize = line[..digits_end].parse().ok()?;
    if n == 0 {
        return None;
    }
    let rest = &line[digits_end..];
    let sep = rest.chars().next()?;
    if !matches!(sep, '.' | ')' | ':') {
        return None;
    }
    let after = &rest[1..];
    if !after.is_empty() && !after.starts_with(' ') {
        return None;
    }
    Some((n, after.trim_start()))
}

/// Map a multi-item model response back to chunk positions. Lines with a
/// numeric marker open item `n`; unmarked lines accumulate into the item
/// opened above them. When no item was extracted at all, a bare
/// line-per-row response is accepted only if the line count matches the
/// chunk size exactly; anything else returns None and the caller retries
/// row by row.
pub fn parse_batch_response(text: &str, expected: usize) -> Option<Vec<String>> {
    let mut items: Vec<Vec<String>> = vec![Vec::new(); expected];
    let mut current: Option<usize> = None;

    for line in text.lines() {
        if let Some((n, rest)) = leading_marker(line.trim_start()) {
            if (1..=expected).contains(&n) {
                current = Some(n - 1);
                if !rest.is_empty() {
                    items[n - 1].push(rest.to_string());
                }
            } else {
                current = None;
            }
            continue;
        }
        if let Some(i) = current {
            items[i].push(line.to_string());
        }
    }

    if items.iter().any(|lines| !lines.is_empty()) {
        return Some(
            items
                .into_iter()
                .map(|lines| lines.join("\n").trim().to_string())
                .collect(),
        );
    }

    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    if lines.len() == expected {
        return Some(lines.into_iter().map(str::to_string).collect());
    }
    None
}

/// Even per-row attribution of a batch call's token total, remainder to
/// the first row so the sum stays exact.
fn split_tokens(total: i64, n: usize) -> Vec<i64> {
    if n == 0 {
        return Vec::new();
    }
    let n = n as i64;
    let base = total / n;
    let rem = total % n;
    (0..n).map(|i| base + if i == 0 { rem } else { 0 }).collect()
}

fn assemble(chunk: &[InputRow], outputs: Vec<String>, total_tokens: i64, cached: bool) -> Vec<RowResult> {
    let tokens = split_tokens(total_tokens, chunk.len());
    chunk
        .iter()
        .zip(outputs)
        .zip(tokens)
        .map(|((row, output), tokens)| RowResult {
            index: row.index,
            input: row.input.clone(),
            output,
            tokens,
            cached,
            error: None,
        })
        .collect()
}

fn store_response(cx: &BatchContext, key: String, response: String, tokens: i64) {
    let cache = cx.cache.clone();
    let model = cx.model.clone();
    tokio::spawn(async move {
        cache.put(&key, &model, &response, tokens).await;
    });
}

/// Run one chunk through the model as a single call, falling back to
/// row-level calls when the chunk call fails or its response cannot be
/// mapped back to rows.
pub async fn process_chunk(chunk: &[InputRow], cx: &BatchContext) -> Vec<RowResult> {
    let prompt = render_numbered_prompt(chunk);
    let key = cache_key(&cx.model, &cx.instructions, &prompt);

    if let Some(hit) = cx.cache.get(&key).await {
        if let Some(outputs) = parse_batch_response(&hit.response, chunk.len()) {
            return assemble(chunk, outputs, hit.tokens_used, true);
        }
        tracing::warn!("cached batch response no longer parseable, re-invoking");
    }

    match cx.invoker.invoke(&cx.instructions, &prompt).await {
        Ok(completion) => {
            store_response(cx, key, completion.text.clone(), completion.total_tokens());
            match parse_batch_response(&completion.text, chunk.len()) {
                Some(outputs) => assemble(chunk, outputs, completion.total_tokens(), false),
                None => {
                    tracing::warn!(
                        chunk_size = chunk.len(),
                        "batch response had no usable item mapping, reprocessing rows individually"
                    );
                    fallback_rows(chunk, cx).await
                }
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, chunk_size = chunk.len(), "batch invocation failed, reprocessing rows individually");
            fallback_rows(chunk, cx).await
        }
    }
}

/// Row-level fallback. A failed row is recorded with an error and an
/// empty output; it still counts as processed.
async fn fallback_rows(chunk: &[InputRow], cx: &BatchContext) -> Vec<RowResult> {
    let mut results = Vec::with_capacity(chunk.len());
    for row in chunk {
        let key = cache_key(&cx.model, &cx.instructions, &row.input);
        if let Some(hit) = cx.cache.get(&key).await {
            results.push(RowResult {
                index: row.index,
                input: row.input.clone(),
                output: hit.response,
                tokens: hit.tokens_used,
                cached: true,
                error: None,
            });
            continue;
        }

        match cx.invoker.invoke(&cx.instructions, &row.input).await {
            Ok(completion) => {
                let tokens = completion.total_tokens();
                store_response(cx, key, completion.text.clone(), tokens);
                results.push(RowResult {
                    index: row.index,
                    input: row.input.clone(),
                    output: completion.text,
                    tokens,
                    cached: false,
                    error: None,
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, row_index = row.index, "row invocation failed");
                results.push(RowResult {
                    index: row.index,
                    input: row.input.clone(),
                    output: String::new(),
                    tokens: 0,
                    cached: false,
                    error: Some(e.to_string()),
                });
            }
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::invoker::stub::{StubInvoker, echo_completion};
    use crate::services::response_cache::memory::MemoryResponseCache;
    use crate::services::{Completion, cache_key};

    fn rows(inputs: &[&str]) -> Vec<InputRow> {
        inputs
            .iter()
            .enumerate()
            .map(|(i, input)| InputRow {
                index: i as i32,
                input: input.to_string(),
            })
            .collect()
    }

    fn context(invoker: Arc<StubInvoker>) -> BatchContext {
        BatchContext {
            invoker,
            cache: Arc::new(MemoryResponseCache::new()),
            model: "test-model".to_string(),
            instructions: "Answer each numbered item.".to_string(),
        }
    }

    async fn settle() {
        // let fire-and-forget cache writes land
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    #[test]
    fn renders_one_based_numbering() {
        let prompt = render_numbered_prompt(&rows(&["alpha", "beta"]));
        assert_eq!(prompt, "1. alpha\n2. beta\n");
    }

    #[test]
    fn template_placeholder_is_stripped_and_folded() {
        let folded = fold_template("Base.", Some("Translate to French: {input}"));
        assert_eq!(folded, "Base.\n\nTranslate to French:");
        assert_eq!(fold_template("Base.", None), "Base.");
        assert_eq!(fold_template("Base.", Some("{input}")), "Base.");
    }

    #[test]
    fn parses_all_three_marker_styles() {
        let outputs =
            parse_batch_response("1. first\n2) second\n3: third", 3).unwrap();
        assert_eq!(outputs, vec!["first", "second", "third"]);
    }

    #[test]
    fn continuation_lines_join_their_item() {
        let text = "1. first line\nstill the first\n2. second";
        let outputs = parse_batch_response(text, 2).unwrap();
        assert_eq!(outputs[0], "first line\nstill the first");
        assert_eq!(outputs[1], "second");
    }

    #[test]
    fn missing_items_map_to_empty_outputs() {
        let outputs = parse_batch_response("1. only\n3. third", 3).unwrap();
        assert_eq!(outputs, vec!["only", "", "third"]);
    }

    #[test]
    fn out_of_range_markers_are_ignored() {
        let outputs = parse_batch_response("1. a\n9. nope\ntrailing", 2).unwrap();
        assert_eq!(outputs[0], "a");
        assert_eq!(outputs[1], "");
    }

    #[test]
    fn decimal_numbers_are_not_markers() {
        // "1.5" must not open item 1
        let outputs = parse_batch_response("1. speed was 2.5 m/s\n2. ok", 2).unwrap();
        assert_eq!(outputs[0], "speed was 2.5 m/s");
    }

    #[test]
    fn positional_fallback_requires_exact_line_count() {
        let outputs = parse_batch_response("alpha\nbeta\ngamma", 3).unwrap();
        assert_eq!(outputs, vec!["alpha", "beta", "gamma"]);

        assert!(parse_batch_response("alpha\nbeta", 3).is_none());
        assert!(parse_batch_response("a\nb\nc\nd", 3).is_none());
    }

    #[test]
    fn token_split_is_exact() {
        assert_eq!(split_tokens(10, 3), vec![4, 3, 3]);
        assert_eq!(split_tokens(9, 3), vec![3, 3, 3]);
        assert!(split_tokens(5, 0).is_empty());
    }

    #[tokio::test]
    async fn chunk_is_answered_in_one_call() {
        let invoker = StubInvoker::echoing();
        let cx = context(invoker.clone());
        let chunk = rows(&["apple", "pear", "plum"]);

        let results = process_chunk(&chunk, &cx).await;

        assert_eq!(invoker.call_count(), 1);
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].output, "ok:apple");
        assert_eq!(results[2].output, "ok:plum");
        assert!(results.iter().all(|r| r.error.is_none() && !r.cached));
        let total: i64 = results.iter().map(|r| r.tokens).sum();
        assert_eq!(total, 24);
    }

    #[tokio::test]
    async fn identical_chunk_hits_the_cache() {
        let invoker = StubInvoker::echoing();
        let cx = context(invoker.clone());
        let chunk = rows(&["apple", "pear"]);

        let first = process_chunk(&chunk, &cx).await;
        settle().await;
        let second = process_chunk(&chunk, &cx).await;

        assert_eq!(invoker.call_count(), 1);
        assert!(second.iter().all(|r| r.cached));
        assert_eq!(first[0].output, second[0].output);
    }

    #[tokio::test]
    async fn batching_matches_individual_calls() {
        let inputs = ["one", "two", "three", "four"];

        let invoker = StubInvoker::echoing();
        let cx = context(invoker);
        let batched = process_chunk(&rows(&inputs), &cx).await;

        let invoker = StubInvoker::echoing();
        let cx = context(invoker);
        let mut individual = Vec::new();
        for chunk in rows(&inputs).chunks(1) {
            individual.extend(process_chunk(chunk, &cx).await);
        }

        for (b, i) in batched.iter().zip(&individual) {
            assert_eq!(b.index, i.index);
            assert_eq!(b.output, i.output);
            assert!(b.error.is_none() && i.error.is_none());
        }
    }

    #[tokio::test]
    async fn failed_chunk_call_reprocesses_every_row() {
        let invoker = StubInvoker::new(|_, content, call| {
            if call == 0 {
                anyhow::bail!("upstream 503")
            }
            Ok(echo_completion(content))
        });
        let cx = context(invoker.clone());
        let chunk = rows(&["a", "b", "c"]);

        let results = process_chunk(&chunk, &cx).await;

        assert_eq!(invoker.call_count(), 4, "one chunk call plus one per row");
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.error.is_none()));
        assert_eq!(results[1].output, "ok:b");
    }

    #[tokio::test]
    async fn unmappable_response_reprocesses_every_row() {
        let invoker = StubInvoker::new(|_, content, call| {
            if call == 0 {
                Ok(Completion {
                    text: "no markers here\nand a line count\nthat does not\nmatch".to_string(),
                    input_tokens: 1,
                    output_tokens: 1,
                })
            } else {
                Ok(echo_completion(content))
            }
        });
        let cx = context(invoker.clone());
        let chunk = rows(&["a", "b"]);

        let results = process_chunk(&chunk, &cx).await;

        assert_eq!(invoker.call_count(), 3);
        assert_eq!(results[0].output, "ok:a");
        assert_eq!(results[1].output, "ok:b");
    }

    #[tokio::test]
    async fn row_failures_are_recorded_not_raised() {
        let invoker = StubInvoker::new(|_, _, _| anyhow::bail!("provider down"));
        let cx = context(invoker);
        let chunk = rows(&["a", "b"]);

        let results = process_chunk(&chunk, &cx).await;

        assert_eq!(results.len(), 2, "failed rows still count as processed");
        for r in &results {
            assert_eq!(r.output, "");
            assert_eq!(r.tokens, 0);
            assert!(r.error.as_deref().unwrap().contains("provider down"));
        }
    }

    #[tokio::test]
    async fn row_fallback_still_consults_the_cache() {
        let invoker = StubInvoker::new(|_, _, _| anyhow::bail!("always down"));
        let cx = context(invoker.clone());
        let chunk = rows(&["warm"]);

        let key = cache_key(&cx.model, &cx.instructions, "warm");
        cx.cache.put(&key, &cx.model, "from cache", 7).await;

        // chunk-level lookup misses (different key), the chunk call fails,
        // and the per-row pass is served from cache
        let results = process_chunk(&chunk, &cx).await;

        assert_eq!(results[0].output, "from cache");
        assert!(results[0].cached);
        assert!(results[0].error.is_none());
    }
}
