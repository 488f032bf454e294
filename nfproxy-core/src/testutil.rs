//! A miniature nftables kernel for tests: chains hold rules with handles,
//! sets hold elements, batches validate before they mutate.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use nfproxy_nft::{BaseChain, Error as NftError, NftDriver, Result as NftResult, RuleHandle, TableFamily};

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct FakeRule {
    pub handle: RuleHandle,
    pub expr: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct FakeTable {
    pub chains: BTreeMap<String, Vec<FakeRule>>,
    pub sets: BTreeMap<String, BTreeSet<String>>,
}

#[derive(Default)]
pub(crate) struct FakeKernel {
    next_handle: RuleHandle,
    tables: BTreeMap<&'static str, FakeTable>,
}

fn driver_err(msg: String) -> NftError {
    NftError::Nft {
        status: 1,
        stderr: msg,
    }
}

impl FakeKernel {
    fn table(&mut self, family: TableFamily) -> &mut FakeTable {
        self.tables.entry(family.keyword()).or_default()
    }

    pub fn has_chain(&self, family: TableFamily, chain: &str) -> bool {
        self.tables
            .get(family.keyword())
            .is_some_and(|t| t.chains.contains_key(chain))
    }

    pub fn has_set(&self, family: TableFamily, set: &str) -> bool {
        self.tables
            .get(family.keyword())
            .is_some_and(|t| t.sets.contains_key(set))
    }

    pub fn rules(&self, family: TableFamily, chain: &str) -> Vec<String> {
        self.tables
            .get(family.keyword())
            .and_then(|t| t.chains.get(chain))
            .map(|rules| rules.iter().map(|r| r.expr.clone()).collect())
            .unwrap_or_default()
    }

    pub fn set_contains(&self, family: TableFamily, set: &str, element: &str) -> bool {
        self.tables
            .get(family.keyword())
            .and_then(|t| t.sets.get(set))
            .is_some_and(|elements| elements.contains(element))
    }

    pub fn set_len(&self, family: TableFamily, set: &str) -> usize {
        self.tables
            .get(family.keyword())
            .and_then(|t| t.sets.get(set))
            .map_or(0, BTreeSet::len)
    }

    pub fn chains_with_prefix(&self, family: TableFamily, prefix: &str) -> Vec<String> {
        self.tables
            .get(family.keyword())
            .map(|t| {
                t.chains
                    .keys()
                    .filter(|name| name.starts_with(prefix))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The full ruleset of one family, for before/after comparisons.
    pub fn snapshot(&self, family: TableFamily) -> FakeTable {
        self.tables
            .get(family.keyword())
            .cloned()
            .unwrap_or_default()
    }

    /// Handle-free view of one family, for comparing rulesets produced by
    /// different operation sequences.
    pub fn text_snapshot(
        &self,
        family: TableFamily,
    ) -> (
        BTreeMap<String, Vec<String>>,
        BTreeMap<String, BTreeSet<String>>,
    ) {
        let table = self.snapshot(family);
        let chains = table
            .chains
            .into_iter()
            .map(|(name, rules)| (name, rules.into_iter().map(|r| r.expr).collect()))
            .collect();
        (chains, table.sets)
    }
}

impl NftDriver for FakeKernel {
    fn reset_table(&mut self, family: TableFamily) -> NftResult<()> {
        self.tables.insert(family.keyword(), FakeTable::default());
        Ok(())
    }

    fn ensure_chain(&mut self, family: TableFamily, name: &str) -> NftResult<()> {
        self.table(family).chains.entry(name.to_string()).or_default();
        Ok(())
    }

    fn ensure_base_chain(
        &mut self,
        family: TableFamily,
        name: &str,
        _base: &BaseChain,
    ) -> NftResult<()> {
        self.ensure_chain(family, name)
    }

    fn delete_chain(&mut self, family: TableFamily, name: &str) -> NftResult<()> {
        let table = self.table(family);
        match table.chains.get(name) {
            None => Err(driver_err(format!("no such chain {name}"))),
            Some(rules) if !rules.is_empty() => {
                Err(driver_err(format!("chain {name} is not empty")))
            }
            Some(_) => {
                table.chains.remove(name);
                Ok(())
            }
        }
    }

    fn ensure_set(&mut self, family: TableFamily, name: &str, _key_type: &str) -> NftResult<()> {
        self.table(family).sets.entry(name.to_string()).or_default();
        Ok(())
    }

    fn append_rule(
        &mut self,
        family: TableFamily,
        chain: &str,
        expr: &str,
    ) -> NftResult<RuleHandle> {
        self.next_handle += 1;
        let handle = self.next_handle;
        let table = self.table(family);
        let Some(rules) = table.chains.get_mut(chain) else {
            return Err(driver_err(format!("no such chain {chain}")));
        };
        rules.push(FakeRule {
            handle,
            expr: expr.to_string(),
        });
        Ok(handle)
    }

    fn insert_rule(
        &mut self,
        family: TableFamily,
        chain: &str,
        after: RuleHandle,
        expr: &str,
    ) -> NftResult<RuleHandle> {
        self.next_handle += 1;
        let handle = self.next_handle;
        let table = self.table(family);
        let Some(rules) = table.chains.get_mut(chain) else {
            return Err(driver_err(format!("no such chain {chain}")));
        };
        let Some(idx) = rules.iter().position(|r| r.handle == after) else {
            return Err(driver_err(format!("no rule with handle {after} in {chain}")));
        };
        rules.insert(
            idx + 1,
            FakeRule {
                handle,
                expr: expr.to_string(),
            },
        );
        Ok(handle)
    }

    fn delete_rule(
        &mut self,
        family: TableFamily,
        chain: &str,
        handle: RuleHandle,
    ) -> NftResult<()> {
        let table = self.table(family);
        let Some(rules) = table.chains.get_mut(chain) else {
            return Err(driver_err(format!("no such chain {chain}")));
        };
        let Some(idx) = rules.iter().position(|r| r.handle == handle) else {
            return Err(driver_err(format!(
                "no rule with handle {handle} in {chain}"
            )));
        };
        rules.remove(idx);
        Ok(())
    }

    fn replace_rules(
        &mut self,
        family: TableFamily,
        chain: &str,
        remove: &[RuleHandle],
        add: &[String],
    ) -> NftResult<Vec<RuleHandle>> {
        // validate up front so a failing batch leaves the table untouched
        {
            let table = self.table(family);
            let Some(rules) = table.chains.get(chain) else {
                return Err(driver_err(format!("no such chain {chain}")));
            };
            for handle in remove {
                if !rules.iter().any(|r| r.handle == *handle) {
                    return Err(driver_err(format!(
                        "no rule with handle {handle} in {chain}"
                    )));
                }
            }
        }
        for handle in remove {
            self.delete_rule(family, chain, *handle)?;
        }
        let mut handles = Vec::with_capacity(add.len());
        for expr in add {
            handles.push(self.append_rule(family, chain, expr)?);
        }
        Ok(handles)
    }

    fn add_set_element(&mut self, family: TableFamily, set: &str, element: &str) -> NftResult<()> {
        let table = self.table(family);
        let Some(elements) = table.sets.get_mut(set) else {
            return Err(driver_err(format!("no such set {set}")));
        };
        elements.insert(element.to_string());
        Ok(())
    }

    fn remove_set_element(
        &mut self,
        family: TableFamily,
        set: &str,
        element: &str,
    ) -> NftResult<()> {
        let table = self.table(family);
        let Some(elements) = table.sets.get_mut(set) else {
            return Err(driver_err(format!("no such set {set}")));
        };
        elements.remove(element);
        Ok(())
    }
}
