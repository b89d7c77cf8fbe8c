/// Resolved option values consumed by the checking core.
#[derive(Clone, Debug)]
pub(crate) struct CheckerOptions {
    /// Apply conservative defaults to classes not `@AnnotatedFor` the checker.
    pub(crate) conservative_defaults: bool,
    /// Apply conservative defaults to classes known only from stubs.
    pub(crate) conservative_bytecode_defaults: bool,
    /// Treat every invoked method as side-effect-free.
    pub(crate) assume_side_effect_free: bool,
    /// Invocations also discard facts about non-final locals.
    pub(crate) side_effects_unrefine_aliases: bool,
    /// Suppression strings applied to every class.
    pub(crate) suppress_warnings: Vec<String>,
    /// Visits of one block after which merges widen.
    pub(crate) widen_after: usize,
    /// Visits of one block after which the analysis of a method gives up.
    pub(crate) max_block_visits: usize,
}

pub(crate) const DEFAULT_WIDEN_AFTER: usize = 3;
pub(crate) const DEFAULT_MAX_BLOCK_VISITS: usize = 64;

impl Default for CheckerOptions {
    fn default() -> Self {
        Self {
            conservative_defaults: false,
            conservative_bytecode_defaults: false,
            assume_side_effect_free: false,
            side_effects_unrefine_aliases: false,
            suppress_warnings: Vec::new(),
            widen_after: DEFAULT_WIDEN_AFTER,
            max_block_visits: DEFAULT_MAX_BLOCK_VISITS,
        }
    }
}
