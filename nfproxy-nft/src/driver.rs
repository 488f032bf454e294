use crate::Result;

/// Kernel-assigned identifier of an installed rule. A rule without a
/// recorded handle cannot be deleted and is not considered installed.
pub type RuleHandle = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TableFamily {
    V4,
    V6,
}

impl TableFamily {
    /// The nftables family keyword, also used for address matches
    /// (`ip daddr` / `ip6 daddr`).
    pub fn keyword(&self) -> &'static str {
        match self {
            TableFamily::V4 => "ip",
            TableFamily::V6 => "ip6",
        }
    }

    /// Element type for set declarations.
    pub fn addr_type(&self) -> &'static str {
        match self {
            TableFamily::V4 => "ipv4_addr",
            TableFamily::V6 => "ipv6_addr",
        }
    }
}

impl std::fmt::Display for TableFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.keyword())
    }
}

/// Hook attachment for a base chain.
#[derive(Clone, Copy, Debug)]
pub struct BaseChain {
    pub chain_type: &'static str,
    pub hook: &'static str,
    pub priority: i32,
}

/// The primitives the reconciler needs from the nftables dataplane.
///
/// Implementations own the table; callers only name chains, sets and rule
/// expressions within it. Every rule mutation is confirmed by the kernel
/// before the returned handle is produced, so a caller that records handles
/// only from successful calls never tracks a rule that is not installed.
pub trait NftDriver {
    /// Drop and recreate the managed table, leaving it empty.
    fn reset_table(&mut self, family: TableFamily) -> Result<()>;

    fn ensure_chain(&mut self, family: TableFamily, name: &str) -> Result<()>;

    fn ensure_base_chain(
        &mut self,
        family: TableFamily,
        name: &str,
        base: &BaseChain,
    ) -> Result<()>;

    fn delete_chain(&mut self, family: TableFamily, name: &str) -> Result<()>;

    fn ensure_set(&mut self, family: TableFamily, name: &str, key_type: &str) -> Result<()>;

    /// Append a rule at the end of a chain.
    fn append_rule(&mut self, family: TableFamily, chain: &str, expr: &str) -> Result<RuleHandle>;

    /// Insert a rule immediately after the rule identified by `after`.
    fn insert_rule(
        &mut self,
        family: TableFamily,
        chain: &str,
        after: RuleHandle,
        expr: &str,
    ) -> Result<RuleHandle>;

    fn delete_rule(&mut self, family: TableFamily, chain: &str, handle: RuleHandle) -> Result<()>;

    /// Delete `remove` and append `add` in one atomic batch, returning the
    /// handles of the appended rules in order.
    fn replace_rules(
        &mut self,
        family: TableFamily,
        chain: &str,
        remove: &[RuleHandle],
        add: &[String],
    ) -> Result<Vec<RuleHandle>>;

    fn add_set_element(&mut self, family: TableFamily, set: &str, element: &str) -> Result<()>;

    /// Removing an element that is not in the set is not an error.
    fn remove_set_element(&mut self, family: TableFamily, set: &str, element: &str) -> Result<()>;
}
