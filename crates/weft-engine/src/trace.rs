//! Strand stacks and the live strand tree.
//!
//! Every strand records the call site of the effect constructor that
//! spawned it. The stack rendering walks parent links upward and is embedded
//! in fault messages; the tree rendering walks live children downward and is
//! what a `DebugTree` effect resumes with.

use weft_types::StrandId;

use crate::scheduler::Engine;

impl Engine {
    /// Upward chain from `id` to the root, rendered root-first. Non-root
    /// frames name the effect and edge that spawned them.
    pub(crate) fn stack(&self, id: StrandId) -> String {
        let mut chain = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            chain.push(current);
            cursor = self.strands[current.index()].parent;
        }

        let mut out = String::new();
        for current in chain.iter().rev() {
            let state = &self.strands[current.index()];
            if let (Some(effect), Some(edge)) = (&state.spawned_by, &state.edge) {
                out.push_str(&format!("Yields effect {effect} ({edge}), created at\n"));
            }
            out.push_str(&format!(
                "File {}, line {}\n",
                state.created_at.file(),
                state.created_at.line()
            ));
        }
        out.trim_end().to_string()
    }

    /// Downward rendering over live children, indented by depth.
    pub(crate) fn tree(&self) -> String {
        let mut lines = Vec::new();
        self.tree_lines(StrandId::new(0), 0, &mut lines);
        lines.join("\n")
    }

    fn tree_lines(&self, id: StrandId, indent: usize, lines: &mut Vec<String>) {
        let state = &self.strands[id.index()];
        let status = if state.shared.is_done() {
            "done".to_string()
        } else if state.shared.is_cancelled() {
            "cancelled".to_string()
        } else {
            match &state.current {
                Some(pending) => format!("waiting for {}", pending.describe),
                None => "running".to_string(),
            }
        };
        lines.push(format!(
            "{:indent$}Strand[{id}] ({status}) at {}:{}",
            "",
            state.created_at.file(),
            state.created_at.line(),
            indent = indent
        ));
        for child in &state.children {
            self.tree_lines(*child, indent + 2, lines);
        }
    }
}
