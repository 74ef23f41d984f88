//! Pluggable priority assignment for newly queued chunks.

use crate::models::ChunkKind;

/// Neutral priority given when no policy applies.
pub const DEFAULT_PRIORITY: f64 = 0.0;

/// What a policy may look at when a chunk is queued.
#[derive(Debug, Clone, Copy)]
pub struct PriorityContext<'a> {
    pub relative_path: &'a str,
    pub kind: ChunkKind,
    pub qualified_name: &'a str,
    /// File modification time, ms since the Unix epoch.
    pub modified_at: Option<i64>,
    /// Pass start, ms since the Unix epoch.
    pub now_ms: i64,
}

pub trait PriorityPolicy: Send + Sync {
    fn priority(&self, ctx: &PriorityContext<'_>) -> f64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NeutralPriority;

impl PriorityPolicy for NeutralPriority {
    fn priority(&self, _ctx: &PriorityContext<'_>) -> f64 {
        DEFAULT_PRIORITY
    }
}

/// Boosts chunks of files edited within `window_ms` of the pass start.
/// Module chunks get half the boost.
#[derive(Debug, Clone, Copy)]
pub struct RecentEditBoost {
    pub window_ms: i64,
    pub boost: f64,
}

impl Default for RecentEditBoost {
    fn default() -> Self {
        Self {
            window_ms: 24 * 60 * 60 * 1000,
            boost: 10.0,
        }
    }
}

impl PriorityPolicy for RecentEditBoost {
    fn priority(&self, ctx: &PriorityContext<'_>) -> f64 {
        let recent = ctx
            .modified_at
            .map(|m| ctx.now_ms.saturating_sub(m) <= self.window_ms)
            .unwrap_or(false);
        match (recent, ctx.kind) {
            (false, _) => DEFAULT_PRIORITY,
            (true, ChunkKind::Module) => self.boost / 2.0,
            (true, _) => self.boost,
        }
    }
}
