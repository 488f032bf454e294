use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use tracing::{debug, trace};

use crate::driver::{BaseChain, NftDriver, RuleHandle, TableFamily};
use crate::{Error, Result};

/// Executes an nftables script and returns whatever nft echoes back.
///
/// Split out of [`NftCli`] so tests can substitute a recording runner for
/// the real binary.
pub trait NftRunner {
    fn run(&mut self, script: &str) -> Result<String>;
}

/// Runs scripts through the `nft` binary. `-e -a` makes nft echo every
/// command it applied, annotated with the kernel-assigned handle, which is
/// the only way to learn rule handles over the CLI.
pub struct NftBin {
    program: PathBuf,
}

impl NftBin {
    pub fn new(program: PathBuf) -> Self {
        Self { program }
    }
}

impl NftRunner for NftBin {
    fn run(&mut self, script: &str) -> Result<String> {
        trace!(%script, "running nft script");
        let mut child = Command::new(&self.program)
            .args(["-e", "-a", "-f", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // stdin is piped just above, so the handle is always present
        let mut stdin = child.stdin.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "nft stdin unavailable")
        })?;
        stdin.write_all(script.as_bytes())?;
        drop(stdin);

        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(Error::Nft {
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// [`NftDriver`] backed by textual nftables scripts, one batch per call.
/// nft applies a script atomically, so every driver operation is all or
/// nothing from the kernel's point of view.
pub struct NftCli<R> {
    runner: R,
    table: String,
}

impl<R: NftRunner> NftCli<R> {
    pub fn new(runner: R, table: impl Into<String>) -> Self {
        Self {
            runner,
            table: table.into(),
        }
    }

    fn run_for_handles(&mut self, script: &str, expected: usize) -> Result<Vec<RuleHandle>> {
        let output = self.runner.run(script)?;
        let handles = parse_rule_handles(&output)?;
        if handles.len() != expected {
            return Err(Error::Parse(format!(
                "expected {} rule handles, nft echoed {}",
                expected,
                handles.len()
            )));
        }
        Ok(handles)
    }
}

impl<R: NftRunner> NftDriver for NftCli<R> {
    fn reset_table(&mut self, family: TableFamily) -> Result<()> {
        let table = &self.table;
        // the leading add makes the delete safe when the table does not exist
        let script = format!(
            "add table {family} {table}\ndelete table {family} {table}\nadd table {family} {table}\n"
        );
        debug!(%family, %table, "resetting table");
        self.runner.run(&script)?;
        Ok(())
    }

    fn ensure_chain(&mut self, family: TableFamily, name: &str) -> Result<()> {
        let script = format!("add chain {family} {} {name}\n", self.table);
        self.runner.run(&script)?;
        Ok(())
    }

    fn ensure_base_chain(
        &mut self,
        family: TableFamily,
        name: &str,
        base: &BaseChain,
    ) -> Result<()> {
        let script = format!(
            "add chain {family} {} {name} {{ type {} hook {} priority {} ; }}\n",
            self.table, base.chain_type, base.hook, base.priority
        );
        self.runner.run(&script)?;
        Ok(())
    }

    fn delete_chain(&mut self, family: TableFamily, name: &str) -> Result<()> {
        let script = format!("delete chain {family} {} {name}\n", self.table);
        self.runner.run(&script)?;
        Ok(())
    }

    fn ensure_set(&mut self, family: TableFamily, name: &str, key_type: &str) -> Result<()> {
        let script = format!(
            "add set {family} {} {name} {{ type {key_type} ; }}\n",
            self.table
        );
        self.runner.run(&script)?;
        Ok(())
    }

    fn append_rule(&mut self, family: TableFamily, chain: &str, expr: &str) -> Result<RuleHandle> {
        let script = format!("add rule {family} {} {chain} {expr}\n", self.table);
        let handles = self.run_for_handles(&script, 1)?;
        Ok(handles[0])
    }

    fn insert_rule(
        &mut self,
        family: TableFamily,
        chain: &str,
        after: RuleHandle,
        expr: &str,
    ) -> Result<RuleHandle> {
        let script = format!(
            "add rule {family} {} {chain} position {after} {expr}\n",
            self.table
        );
        let handles = self.run_for_handles(&script, 1)?;
        Ok(handles[0])
    }

    fn delete_rule(&mut self, family: TableFamily, chain: &str, handle: RuleHandle) -> Result<()> {
        let script = format!(
            "delete rule {family} {} {chain} handle {handle}\n",
            self.table
        );
        self.runner.run(&script)?;
        Ok(())
    }

    fn replace_rules(
        &mut self,
        family: TableFamily,
        chain: &str,
        remove: &[RuleHandle],
        add: &[String],
    ) -> Result<Vec<RuleHandle>> {
        let table = &self.table;
        let mut script = String::new();
        for handle in remove {
            script.push_str(&format!(
                "delete rule {family} {table} {chain} handle {handle}\n"
            ));
        }
        for expr in add {
            script.push_str(&format!("add rule {family} {table} {chain} {expr}\n"));
        }
        self.run_for_handles(&script, add.len())
    }

    fn add_set_element(&mut self, family: TableFamily, set: &str, element: &str) -> Result<()> {
        let script = format!(
            "add element {family} {} {set} {{ {element} }}\n",
            self.table
        );
        self.runner.run(&script)?;
        Ok(())
    }

    fn remove_set_element(&mut self, family: TableFamily, set: &str, element: &str) -> Result<()> {
        // destroy (nft >= 1.0.8) succeeds when the element is already gone
        let script = format!(
            "destroy element {family} {} {set} {{ {element} }}\n",
            self.table
        );
        self.runner.run(&script)?;
        Ok(())
    }
}

/// Pulls the kernel handles out of echoed `add rule` lines, preserving
/// script order.
fn parse_rule_handles(output: &str) -> Result<Vec<RuleHandle>> {
    let mut handles = Vec::new();
    for line in output.lines() {
        let trimmed = line.trim_start();
        if !trimmed.starts_with("add rule") && !trimmed.starts_with("insert rule") {
            continue;
        }
        let Some((_, suffix)) = trimmed.rsplit_once("# handle ") else {
            return Err(Error::MissingHandle(trimmed.to_string()));
        };
        let handle = suffix
            .trim()
            .parse::<RuleHandle>()
            .map_err(|e| Error::Parse(format!("bad handle in {trimmed:?}: {e}")))?;
        handles.push(handle);
    }
    Ok(handles)
}
