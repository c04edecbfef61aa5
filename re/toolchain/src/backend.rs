use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use log::debug;
use regex::Regex;
use simple_error::bail;

use crate::{Error, Toolchain};

/// Fixed parameters of one fuzzing job: which device to target, which
/// tiles the solvers will scope their diffs to, and the design template
/// the per-sample substitutions are applied to.
#[derive(Debug, Clone)]
pub struct JobConfig {
    pub device: String,
    pub job: String,
    pub tiles: Vec<String>,
    pub template: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipInfo {
    pub from_wire: String,
    pub to_wire: String,
    pub is_bidi: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub name: String,
    pub uphill_pips: Vec<PipInfo>,
    pub downhill_pips: Vec<PipInfo>,
}

/// What the orchestration needs from the vendor CAD tool, and nothing
/// more.  The solvers only ever see the returned bitstream paths and
/// routing-graph facts.
pub trait CadBackend {
    /// Apply `substitutions` to the job's design template, run the vendor
    /// flow and return the path of the produced bitstream.
    fn build_bitstream(
        &self,
        job: &JobConfig,
        prefix: &str,
        substitutions: &BTreeMap<String, String>,
    ) -> Result<PathBuf, Error>;

    /// Query the routing graph for the given nodes.
    fn query_nodes(&self, job: &JobConfig, nodes: &[String]) -> Result<Vec<NodeInfo>, Error>;
}

/// Replace `${key}` variables in a design template.  A variable with no
/// substitution is an error, not silently left in place.
pub fn substitute_template(
    text: &str,
    substitutions: &BTreeMap<String, String>,
) -> Result<String, Error> {
    let var_re = Regex::new(r"\$\{([A-Za-z0-9_.]+)\}")?;
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for caps in var_re.captures_iter(text) {
        let m = caps.get(0).unwrap();
        let key = &caps[1];
        out.push_str(&text[last..m.start()]);
        match substitutions.get(key) {
            Some(value) => out.push_str(value),
            None => bail!("template variable {key} has no substitution"),
        }
        last = m.end();
    }
    out.push_str(&text[last..]);
    Ok(out)
}

/// Parse the node report emitted by the query script.  Format, one entry
/// per node:
///
/// ```text
/// node <name>
///   uphill <from> -> <to>
///   downhill <from> <-> <to>
/// ```
pub fn parse_node_report(report: &str) -> Result<Vec<NodeInfo>, Error> {
    let node_re = Regex::new(r"^node\s+(\S+)\s*$")?;
    let pip_re = Regex::new(r"^\s+(uphill|downhill)\s+(\S+)\s+(->|<->)\s+(\S+)\s*$")?;
    let mut nodes: Vec<NodeInfo> = Vec::new();
    for line in report.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if let Some(caps) = node_re.captures(line) {
            nodes.push(NodeInfo {
                name: caps[1].to_string(),
                uphill_pips: Vec::new(),
                downhill_pips: Vec::new(),
            });
        } else if let Some(caps) = pip_re.captures(line) {
            let Some(node) = nodes.last_mut() else {
                bail!("pip line before any node in report: {line}");
            };
            let pip = PipInfo {
                from_wire: caps[2].to_string(),
                to_wire: caps[4].to_string(),
                is_bidi: &caps[3] == "<->",
            };
            match &caps[1] {
                "uphill" => node.uphill_pips.push(pip),
                _ => node.downhill_pips.push(pip),
            }
        } else {
            bail!("unrecognized line in node report: {line}");
        }
    }
    Ok(nodes)
}

/// Adapter running configured shell scripts for each capability.  Scripts
/// get the device name and the relevant file paths as arguments and run
/// inside a scratch directory that lives as long as the backend.
pub struct ScriptBackend {
    toolchain: Toolchain,
    build_script: String,
    query_script: String,
    work_dir: tempfile::TempDir,
}

impl ScriptBackend {
    pub fn new(
        toolchain: Toolchain,
        build_script: &str,
        query_script: &str,
    ) -> Result<Self, Error> {
        Ok(Self {
            toolchain,
            build_script: build_script.to_string(),
            query_script: query_script.to_string(),
            work_dir: tempfile::tempdir()?,
        })
    }
}

impl CadBackend for ScriptBackend {
    fn build_bitstream(
        &self,
        job: &JobConfig,
        prefix: &str,
        substitutions: &BTreeMap<String, String>,
    ) -> Result<PathBuf, Error> {
        let template = fs::read_to_string(&job.template)?;
        let source = substitute_template(&template, substitutions)?;
        let src_path = self.work_dir.path().join(format!("{prefix}.v"));
        fs::write(&src_path, source)?;
        let bit_path = self.work_dir.path().join(format!("{prefix}.bit"));
        debug!(
            "job {job}: building {prefix} on {device}",
            job = job.job,
            device = job.device
        );
        let status = self
            .toolchain
            .command(&self.build_script)?
            .arg(&job.device)
            .arg(&src_path)
            .arg(&bit_path)
            .current_dir(self.work_dir.path())
            .status()?;
        if !status.success() {
            bail!("build script failed for {prefix} in job {} ({status})", job.job);
        }
        Ok(bit_path)
    }

    fn query_nodes(&self, job: &JobConfig, nodes: &[String]) -> Result<Vec<NodeInfo>, Error> {
        debug!(
            "job {job}: querying {n} nodes",
            job = job.job,
            n = nodes.len()
        );
        let output = self
            .toolchain
            .command(&self.query_script)?
            .arg(&job.device)
            .args(nodes)
            .current_dir(self.work_dir.path())
            .output()?;
        if !output.status.success() {
            bail!("query script failed in job {} ({})", job.job, output.status);
        }
        parse_node_report(&String::from_utf8(output.stdout)?)
    }
}
