//! 对话账本：有序 Turn 序列与配对不变式
//!
//! 维护 tool_use / tool_result 的严格配对：每个 tool_result 必须引用此前 assistant
//! Turn 发出且尚未被满足的 tool_use id，且同一 id 只能被满足一次。append / trim /
//! load 之后都会重新规范化，损坏的回放（引用未知或已满足 id 的回执 Turn）被整体丢弃。

use std::collections::HashSet;

use crate::memory::{Role, Turn};

/// 有序对话账本；超出 max_turns 时丢弃最旧 Turn 并重新规范化，保证不产生孤儿回执
#[derive(Clone, Debug)]
pub struct HistoryLedger {
    turns: Vec<Turn>,
    max_turns: usize,
}

impl HistoryLedger {
    pub fn new(max_turns: usize) -> Self {
        Self {
            turns: Vec::new(),
            max_turns,
        }
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    /// 追加一个 Turn，随后规范化并收敛到 max_turns 以内
    pub fn append(&mut self, turn: Turn) {
        self.turns.push(turn);
        self.normalize();
        if self.turns.len() > self.max_turns {
            self.trim(self.max_turns);
        }
    }

    /// 用存储中读出的 Turn 序列替换当前内容，并做同样的规范化
    pub fn load(&mut self, turns: Vec<Turn>) {
        self.turns = turns;
        self.normalize();
        if self.turns.len() > self.max_turns {
            self.trim(self.max_turns);
        }
    }

    /// 只保留最近 max 个 Turn，然后重新规范化；截断产生的孤儿回执 Turn 被整体丢弃
    pub fn trim(&mut self, max: usize) {
        if self.turns.len() > max {
            let drop = self.turns.len() - max;
            self.turns.drain(..drop);
        }
        self.normalize();
    }

    /// 规范化：顺序扫描，跟踪 assistant 已发出且未满足的 tool_use id 集合。
    /// 含 tool_result 的 user Turn 采用整体判定：其全部引用必须命中未满足集合且
    /// 内部无重复引用，否则整个 Turn 丢弃。规范化是幂等的。
    pub fn normalize(&mut self) {
        let mut outstanding: HashSet<String> = HashSet::new();
        let mut kept: Vec<Turn> = Vec::with_capacity(self.turns.len());

        for turn in self.turns.drain(..) {
            match turn.role {
                Role::Assistant => {
                    for id in turn.tool_use_ids() {
                        outstanding.insert(id.to_string());
                    }
                    kept.push(turn);
                }
                Role::User => {
                    if !turn.has_tool_results() {
                        kept.push(turn);
                        continue;
                    }
                    let refs = turn.tool_result_ids();
                    let mut seen: HashSet<&str> = HashSet::new();
                    let valid = refs
                        .iter()
                        .all(|id| outstanding.contains(*id) && seen.insert(*id));
                    if valid {
                        for id in refs {
                            outstanding.remove(id);
                        }
                        kept.push(turn);
                    } else {
                        tracing::warn!(
                            refs = ?refs,
                            "dropping tool_result turn referencing unknown or already-satisfied ids"
                        );
                    }
                }
            }
        }

        self.turns = kept;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ContentBlock;

    fn assistant_with_tool(id: &str) -> Turn {
        Turn {
            role: Role::Assistant,
            blocks: vec![
                ContentBlock::text("calling"),
                ContentBlock::tool_use(id, "list_x", serde_json::json!({})),
            ],
        }
    }

    fn result_turn(id: &str) -> Turn {
        Turn::tool_results(vec![ContentBlock::tool_result(id, "[]", false)])
    }

    /// 验证账本满足配对不变式：每个回执引用此前未满足的 tool_use，且无重复满足
    fn assert_paired(ledger: &HistoryLedger) {
        let mut outstanding: HashSet<String> = HashSet::new();
        for turn in ledger.turns() {
            for id in turn.tool_use_ids() {
                outstanding.insert(id.to_string());
            }
            for id in turn.tool_result_ids() {
                assert!(outstanding.remove(id), "orphan tool_result: {id}");
            }
        }
    }

    #[test]
    fn test_pairing_kept_for_valid_sequence() {
        let mut ledger = HistoryLedger::new(50);
        ledger.append(Turn::user("list please"));
        ledger.append(assistant_with_tool("tu_1"));
        ledger.append(result_turn("tu_1"));
        ledger.append(Turn::assistant("done"));
        assert_eq!(ledger.len(), 4);
        assert_paired(&ledger);
    }

    #[test]
    fn test_unknown_id_turn_dropped() {
        let mut ledger = HistoryLedger::new(50);
        ledger.append(Turn::user("hi"));
        ledger.append(result_turn("tu_ghost"));
        assert_eq!(ledger.len(), 1);
        assert_paired(&ledger);
    }

    #[test]
    fn test_double_satisfaction_dropped() {
        let mut ledger = HistoryLedger::new(50);
        ledger.append(assistant_with_tool("tu_1"));
        ledger.append(result_turn("tu_1"));
        // 同一 id 的第二个回执是损坏回放，整 Turn 丢弃
        ledger.append(result_turn("tu_1"));
        assert_eq!(ledger.len(), 2);
        assert_paired(&ledger);
    }

    #[test]
    fn test_duplicate_refs_within_turn_dropped() {
        let mut ledger = HistoryLedger::new(50);
        ledger.append(assistant_with_tool("tu_1"));
        ledger.append(Turn::tool_results(vec![
            ContentBlock::tool_result("tu_1", "a", false),
            ContentBlock::tool_result("tu_1", "b", false),
        ]));
        assert_eq!(ledger.len(), 1);
        assert_paired(&ledger);
    }

    #[test]
    fn test_trim_never_orphans_results() {
        for max in 0..6 {
            let mut ledger = HistoryLedger::new(50);
            ledger.append(Turn::user("q"));
            ledger.append(assistant_with_tool("tu_1"));
            ledger.append(result_turn("tu_1"));
            ledger.append(Turn::assistant("answer"));
            ledger.trim(max);
            assert!(ledger.len() <= max);
            assert_paired(&ledger);
            if let Some(first) = ledger.turns().first() {
                assert!(
                    !first.has_tool_results(),
                    "leading orphan tool_result after trim to {max}"
                );
            }
        }
    }

    #[test]
    fn test_append_enforces_bound() {
        let mut ledger = HistoryLedger::new(3);
        for i in 0..10 {
            ledger.append(Turn::user(format!("msg {i}")));
        }
        assert_eq!(ledger.len(), 3);
        assert_eq!(ledger.turns()[2].text(), "msg 9");
    }

    #[test]
    fn test_normalize_idempotent() {
        let mut ledger = HistoryLedger::new(50);
        ledger.load(vec![
            Turn::user("q"),
            assistant_with_tool("tu_1"),
            result_turn("tu_ghost"),
            result_turn("tu_1"),
            Turn::assistant("a"),
        ]);
        let once = ledger.turns().to_vec();
        ledger.normalize();
        assert_eq!(ledger.turns(), &once[..]);
    }

    #[test]
    fn test_load_normalizes_corrupt_replay() {
        let mut ledger = HistoryLedger::new(50);
        ledger.load(vec![
            result_turn("tu_1"),
            Turn::user("q"),
            assistant_with_tool("tu_2"),
            result_turn("tu_2"),
        ]);
        assert_eq!(ledger.len(), 3);
        assert_paired(&ledger);
    }

    #[test]
    fn test_outstanding_accumulates_across_assistant_turns() {
        let mut ledger = HistoryLedger::new(50);
        ledger.append(assistant_with_tool("tu_1"));
        ledger.append(assistant_with_tool("tu_2"));
        ledger.append(Turn::tool_results(vec![
            ContentBlock::tool_result("tu_1", "a", false),
            ContentBlock::tool_result("tu_2", "b", false),
        ]));
        assert_eq!(ledger.len(), 3);
        assert_paired(&ledger);
    }
}
