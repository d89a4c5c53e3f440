//! Hands averaged files over to an external chart renderer.
//!
//! Rendering itself is not done here. For every `[[comparison]]` and request count, the renderer
//! is invoked once per chart type whose averaged input exists on both sides:
//!
//! ```text
//! <plot> --gt <type> --csv1 <left> --csv2 <right> --dir <graphs>
//!        --l1 <label> --l2 <label> --c1 <color> --c2 <color> --name <left>_vs_<right>/<chart>
//! ```
//!
//! Each variant also gets a latency percentile chart per mode and request count (`--gt perc`,
//! single input). A renderer ending in `.py` is run through `python3`.

use crate::config::{Comparison, HarnessConfig, Variant};
use crate::error::{Error, Result};
use crate::record::{avg_file_name, DurabilityMode, Family, Fsync};
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::process::Command;

/// Chart types and the averaged family each one reads.
pub const CHARTS: [(&str, Family); 5] = [
    ("cpu", Family::Usage),
    ("mem", Family::Usage),
    ("syscall", Family::Syscalls),
    ("syscalltime", Family::SyscallTimes),
    ("rps", Family::Performance),
];

/// One renderer invocation.
#[derive(Clone, Debug, PartialEq)]
pub struct Chart {
    pub kind: &'static str,
    pub inputs: Vec<(PathBuf, String, Option<String>)>,
    pub name: String,
}

impl Chart {
    fn args(&self, graphs: &Path) -> Vec<String> {
        let mut args = vec!["--gt".to_string(), self.kind.to_string()];
        for (i, (csv, _, _)) in self.inputs.iter().enumerate() {
            args.push(format!("--csv{}", i + 1));
            args.push(csv.display().to_string());
        }
        args.push("--dir".to_string());
        args.push(graphs.display().to_string());
        for (i, (_, label, color)) in self.inputs.iter().enumerate() {
            if self.inputs.len() > 1 {
                args.push(format!("--l{}", i + 1));
                args.push(label.clone());
            }
            if let Some(color) = color {
                args.push(format!("--c{}", i + 1));
                args.push(color.clone());
            }
        }
        args.push("--name".to_string());
        args.push(self.name.clone());
        args
    }
}

fn input(
    config: &HarnessConfig,
    variant: &Variant,
    mode: DurabilityMode,
    requests: u64,
    family: Family,
) -> (PathBuf, String, Option<String>) {
    (
        config
            .csv_dir(variant)
            .join(avg_file_name(mode, requests, family)),
        variant.label.clone(),
        variant.color.clone(),
    )
}

fn comparison_charts(config: &HarnessConfig, cmp: &Comparison, requests: u64) -> Vec<Chart> {
    let (Some(left), Some(right)) = (config.variant(&cmp.left), config.variant(&cmp.right)) else {
        debug!("Skipping comparison {} vs {}: variant not selected", cmp.left, cmp.right);
        return vec![];
    };
    let fsync = cmp.fsync.unwrap_or(Fsync::Always);
    let (Some(lmode), Some(rmode)) = (left.mode_for(fsync), right.mode_for(fsync)) else {
        warn!(
            "Skipping comparison {} vs {}: no {} mode",
            cmp.left,
            cmp.right,
            fsync.as_str()
        );
        return vec![];
    };
    let pair = format!("{}_vs_{}", left.name, right.name);
    CHARTS
        .iter()
        .map(|(kind, family)| Chart {
            kind: *kind,
            inputs: vec![
                input(config, left, lmode, requests, *family),
                input(config, right, rmode, requests, *family),
            ],
            name: format!("{}/{}_{}_{}_{}", pair, kind, pair, fsync.as_str(), requests),
        })
        .collect()
}

fn percentile_charts(config: &HarnessConfig, variant: &Variant, requests: u64) -> Vec<Chart> {
    variant
        .modes
        .iter()
        .map(|mode| Chart {
            kind: "perc",
            inputs: vec![input(config, variant, *mode, requests, Family::Performance)],
            name: format!("{}/perc_{}_{}", variant.name, mode, requests),
        })
        .collect()
}

/// Every chart the configuration asks for, whether or not its inputs exist.
pub fn charts(config: &HarnessConfig) -> Vec<Chart> {
    let mut out = Vec::new();
    for requests in config.requests.iter() {
        for variant in config.variants.iter() {
            out.extend(percentile_charts(config, variant, *requests));
        }
        for cmp in config.comparisons.iter() {
            out.extend(comparison_charts(config, cmp, *requests));
        }
    }
    out
}

fn renderer_command(renderer: &Path) -> Command {
    if renderer.extension().is_some_and(|e| e == "py") {
        let mut cmd = Command::new("python3");
        cmd.arg(renderer);
        cmd
    } else {
        Command::new(renderer)
    }
}

/// Invoke the renderer for every chart whose inputs exist. Returns how many charts were rendered.
pub fn render(config: &HarnessConfig, renderer: &Path) -> Result<usize> {
    let graphs = config.graphs_dir();
    let mut rendered = 0;
    for chart in charts(config) {
        if let Some((missing, _, _)) = chart.inputs.iter().find(|(p, _, _)| !p.exists()) {
            debug!("Skipping chart {}: {} not found", chart.name, missing.display());
            continue;
        }
        if let Some(parent) = graphs.join(&chart.name).parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut cmd = renderer_command(renderer);
        cmd.args(chart.args(&graphs));
        debug!("Rendering: {:?}", cmd);
        let status = cmd.status()?;
        if !status.success() {
            return Err(Error::RenderFailure {
                command: format!("{:?}", cmd),
                status,
            });
        }
        rendered += 1;
    }
    info!("Rendered {} charts into {}", rendered, graphs.display());
    Ok(rendered)
}
