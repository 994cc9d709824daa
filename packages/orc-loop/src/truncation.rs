//! Screenshot pruning, cache breakpoints, and token accounting (§4.2, §8).

use orc_providers::{CacheControl, ContentBlock, Message, Role, Usage};

/// Prunes the oldest screenshot images from `tool_result` content so at
/// most `only_n_most_recent_images` remain, removing in chunks of
/// `min_removal_threshold` to preserve prompt-cache prefixes (§4.2, §8).
pub fn prune_screenshots(history: &mut [Message], only_n_most_recent_images: usize, min_removal_threshold: usize) {
    if min_removal_threshold == 0 {
        return;
    }

    let mut image_locations: Vec<(usize, usize, usize)> = Vec::new();
    for (msg_idx, message) in history.iter().enumerate() {
        for (block_idx, block) in message.content.iter().enumerate() {
            if let ContentBlock::ToolResult { content, .. } = block {
                for (inner_idx, inner) in content.iter().enumerate() {
                    if inner.is_image() {
                        image_locations.push((msg_idx, block_idx, inner_idx));
                    }
                }
            }
        }
    }

    let total = image_locations.len();
    let excess = total.saturating_sub(only_n_most_recent_images);
    let to_remove = (excess / min_removal_threshold) * min_removal_threshold;
    if to_remove == 0 {
        return;
    }

    // Oldest-first; mark the (msg_idx, block_idx, inner_idx) triples to
    // drop, then remove back-to-front within each tool_result so earlier
    // indices in the same content vector stay valid.
    let mut to_drop: Vec<(usize, usize, usize)> = image_locations.into_iter().take(to_remove).collect();
    to_drop.sort_by(|a, b| b.cmp(a));

    for (msg_idx, block_idx, inner_idx) in to_drop {
        if let Some(ContentBlock::ToolResult { content, .. }) = history[msg_idx].content.get_mut(block_idx) {
            if inner_idx < content.len() {
                content.remove(inner_idx);
            }
        }
    }
}

/// Marks the last content element of the three most recent `user` messages
/// with an ephemeral cache-control hint, stripping any older markers so at
/// most three breakpoints are ever active (§4.2, §8).
pub fn apply_cache_breakpoints(history: &mut [Message]) {
    for message in history.iter_mut() {
        for block in message.content.iter_mut() {
            block.set_cache_control(None);
        }
    }

    let user_indices: Vec<usize> = history.iter().enumerate().filter(|(_, m)| m.role == Role::User).map(|(i, _)| i).collect();
    let breakpoints: Vec<usize> = user_indices.into_iter().rev().take(3).collect();

    for idx in breakpoints {
        if let Some(block) = history[idx].content.last_mut() {
            block.set_cache_control(Some(CacheControl::Ephemeral));
        }
    }
}

/// A job-level running total of the weighted token usage formula in §4.2/§8.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenCounter {
    total: i64,
}

impl TokenCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total(&self) -> i64 {
        self.total
    }

    /// Folds one provider exchange's usage into the running total and
    /// returns the new total.
    pub fn accumulate(&mut self, usage: &Usage) -> i64 {
        self.total += usage.weighted_total();
        self.total
    }

    pub fn exceeds(&self, limit: i64) -> bool {
        self.total > limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool_result_with_images(tool_use_id: &str, image_count: usize) -> Message {
        let mut content = Vec::new();
        for _ in 0..image_count {
            content.push(ContentBlock::Image { media_type: "image/png".to_string(), data: "abc".to_string(), cache_control: None });
        }
        Message { role: Role::User, content: vec![ContentBlock::tool_result(tool_use_id, content, None)] }
    }

    #[test]
    fn prunes_oldest_images_down_to_a_multiple_of_the_removal_threshold() {
        let mut history = vec![
            tool_result_with_images("t1", 1),
            tool_result_with_images("t2", 1),
            tool_result_with_images("t3", 1),
            tool_result_with_images("t4", 1),
            tool_result_with_images("t5", 1),
        ];
        // 5 images, keep 1, excess = 4, threshold = 2 -> remove 4, not 5.
        prune_screenshots(&mut history, 1, 2);

        let remaining: usize = history
            .iter()
            .flat_map(|m| &m.content)
            .filter_map(|b| match b {
                ContentBlock::ToolResult { content, .. } => Some(content.iter().filter(|i| i.is_image()).count()),
                _ => None,
            })
            .sum();
        assert_eq!(remaining, 1);
    }

    #[test]
    fn leaves_everything_when_excess_is_below_the_threshold() {
        let mut history = vec![tool_result_with_images("t1", 1), tool_result_with_images("t2", 1)];
        // 2 images, keep 2, excess = 0 -> nothing removed.
        prune_screenshots(&mut history, 2, 10);
        let remaining: usize = history
            .iter()
            .flat_map(|m| &m.content)
            .filter_map(|b| match b {
                ContentBlock::ToolResult { content, .. } => Some(content.iter().filter(|i| i.is_image()).count()),
                _ => None,
            })
            .sum();
        assert_eq!(remaining, 2);
    }

    #[test]
    fn only_the_three_most_recent_user_messages_carry_a_breakpoint() {
        let mut history = vec![
            Message { role: Role::User, content: vec![ContentBlock::text("u1")] },
            Message { role: Role::Assistant, content: vec![ContentBlock::text("a1")] },
            Message { role: Role::User, content: vec![ContentBlock::text("u2")] },
            Message { role: Role::User, content: vec![ContentBlock::text("u3")] },
            Message { role: Role::User, content: vec![ContentBlock::text("u4")] },
        ];
        apply_cache_breakpoints(&mut history);

        let marked: Vec<bool> = history
            .iter()
            .filter(|m| m.role == Role::User)
            .map(|m| matches!(m.content.last(), Some(ContentBlock::Text { cache_control: Some(CacheControl::Ephemeral), .. })))
            .collect();
        assert_eq!(marked, vec![false, true, true, true]);
    }

    #[test]
    fn token_counter_matches_the_documented_weighting() {
        let mut counter = TokenCounter::new();
        let total = counter.accumulate(&Usage { input_tokens: 100, output_tokens: 50, cache_creation_input_tokens: 40, cache_read_input_tokens: 100 });
        assert_eq!(total, 210);
        assert!(counter.exceeds(200));
        assert!(!counter.exceeds(210));
    }
}
