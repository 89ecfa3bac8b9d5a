/// Tunable knobs shared by the reducer and the task-list sync.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Tool name whose `running` invocations carry the agent-authored todo
    /// list in `input.todos`.
    pub task_tool: String,
    /// Key prefix under which task documents live in the key-value store.
    pub task_prefix: String,
    /// How many times a conflicting multi-key task write is rebased before
    /// falling back to a full resync.
    pub write_retries: u32,
    /// Page size for `list` calls during hydration/resync.
    pub list_page_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            task_tool: "TodoWrite".to_string(),
            task_prefix: "task:".to_string(),
            write_retries: 3,
            list_page_size: 256,
        }
    }
}

impl SyncConfig {
    pub fn with_task_tool(mut self, name: impl Into<String>) -> Self {
        self.task_tool = name.into();
        self
    }

    pub fn with_task_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.task_prefix = prefix.into();
        self
    }

    pub fn with_write_retries(mut self, retries: u32) -> Self {
        self.write_retries = retries;
        self
    }
}
