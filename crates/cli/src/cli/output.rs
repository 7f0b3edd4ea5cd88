//! Output formatting for build plans, images and health checks
//!
//! Every report can be rendered as JSON, YAML or human-readable text. The
//! human form is meant for terminals; JSON and YAML are stable enough to script
//! against.

use anyhow::{Context, Result};
use serde::Serialize;
use slipway_core::image::{BuiltImage, StepKind};
use slipway_pipeline::{BuildPlan, PruneReport};
use std::collections::BTreeMap;

const RULE: &str = "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━";

/// Output format enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// JSON format (machine-readable)
    Json,
    /// YAML format (human-friendly, version-control friendly)
    Yaml,
    /// Human-readable formatted text
    Human,
}

#[derive(Debug, Serialize)]
struct PlanStep {
    index: usize,
    step: StepKind,
    instruction: String,
}

#[derive(Debug, Serialize)]
struct ImageSummary<'a> {
    name: &'a str,
    id: String,
    base: String,
    layers: usize,
    size: u64,
    created: String,
}

pub struct OutputFormatter {
    format: OutputFormat,
}

impl OutputFormatter {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    fn serialize<T: Serialize + ?Sized>(&self, value: &T, what: &str) -> Result<String> {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(value)
                .with_context(|| format!("Failed to serialize {} to JSON", what)),
            OutputFormat::Yaml | OutputFormat::Human => serde_yaml::to_string(value)
                .with_context(|| format!("Failed to serialize {} to YAML", what)),
        }
    }

    /// Formats the ordered steps of a build plan
    pub fn format_plan(&self, plan: &BuildPlan) -> Result<String> {
        let steps: Vec<PlanStep> = plan
            .steps
            .iter()
            .enumerate()
            .map(|(i, step)| PlanStep {
                index: i + 1,
                step: step.kind(),
                instruction: step.describe(),
            })
            .collect();

        if self.format != OutputFormat::Human {
            return self.serialize(&steps, "build plan");
        }

        let mut output = String::new();
        output.push_str("Build Plan\n");
        output.push_str(RULE);
        output.push_str("\n\n");
        for (i, step) in steps.iter().enumerate() {
            let connector = if i + 1 == steps.len() {
                "\u{2514}"
            } else {
                "\u{251C}"
            };
            output.push_str(&format!(
                "{}\u{2500} [{}/{}] {:<12} {}\n",
                connector,
                step.index,
                steps.len(),
                step.step.as_str(),
                step.instruction
            ));
        }
        Ok(output)
    }

    /// Formats one image record with its layer chain
    pub fn format_image(&self, image: &BuiltImage) -> Result<String> {
        if self.format != OutputFormat::Human {
            return self.serialize(image, "image record");
        }

        let mut output = String::new();
        output.push_str(&format!("\u{2713} Image {}\n", image.name));
        output.push_str(RULE);
        output.push_str("\n\n");

        output.push_str(&format!("ID:       {}\n", image.id));
        output.push_str(&format!("Base:     {}\n", image.base));
        output.push_str(&format!(
            "Created:  {}\n",
            image.created.format("%Y-%m-%d %H:%M:%S UTC")
        ));
        output.push_str(&format!("Size:     {}\n", human_size(image.size())));
        output.push_str(&format!("Build:    {}\n\n", image.build_id));

        output.push_str("Layers:\n");
        for (i, layer) in image.layers.iter().enumerate() {
            let connector = if i + 1 == image.layers.len() {
                "\u{2514}"
            } else {
                "\u{251C}"
            };
            let size = if layer.diff_id.is_some() {
                human_size(layer.size)
            } else {
                "-".to_string()
            };
            output.push_str(&format!(
                "{}\u{2500} {}  {:>9}  {}\n",
                connector,
                layer.digest.short(),
                size,
                layer.created_by
            ));
        }
        output.push('\n');

        let config = &image.config;
        output.push_str("Runtime:\n");
        output.push_str(&format!("\u{251C}\u{2500} Workdir:     {}\n", config.workdir));
        if config.env.is_empty() {
            output.push_str("\u{251C}\u{2500} Env:         (none)\n");
        } else {
            let env: Vec<String> = config
                .env
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            output.push_str(&format!("\u{251C}\u{2500} Env:         {}\n", env.join(" ")));
        }
        if config.exposed_ports.is_empty() {
            output.push_str("\u{251C}\u{2500} Ports:       (none)\n");
        } else {
            let ports: Vec<String> = config.exposed_ports.iter().map(|p| p.to_string()).collect();
            output.push_str(&format!(
                "\u{251C}\u{2500} Ports:       {} (advisory)\n",
                ports.join(" ")
            ));
        }
        output.push_str(&format!(
            "\u{2514}\u{2500} Entrypoint:  {:?}\n",
            config.entrypoint
        ));

        Ok(output)
    }

    /// Formats the list of images in a cache directory
    pub fn format_images(&self, images: &[BuiltImage]) -> Result<String> {
        let summaries: Vec<ImageSummary> = images
            .iter()
            .map(|image| ImageSummary {
                name: &image.name,
                id: image.id.to_string(),
                base: image.base.to_string(),
                layers: image.layers.len(),
                size: image.size(),
                created: image.created.to_rfc3339(),
            })
            .collect();

        if self.format != OutputFormat::Human {
            return self.serialize(&summaries, "image list");
        }

        if summaries.is_empty() {
            return Ok("No images\n".to_string());
        }

        let width = summaries.iter().map(|s| s.name.len()).max().unwrap_or(4).max(4);
        let mut output = format!(
            "{:<width$}  {:<12}  {:>6}  {:>9}  BASE\n",
            "NAME",
            "ID",
            "LAYERS",
            "SIZE",
            width = width
        );
        for (summary, image) in summaries.iter().zip(images) {
            output.push_str(&format!(
                "{:<width$}  {:<12}  {:>6}  {:>9}  {}\n",
                summary.name,
                image.id.short(),
                summary.layers,
                human_size(summary.size),
                summary.base,
                width = width
            ));
        }
        Ok(output)
    }

    pub fn format_prune(&self, report: &PruneReport) -> Result<String> {
        if self.format != OutputFormat::Human {
            return self.serialize(report, "prune report");
        }
        Ok(format!(
            "Removed {} layer record(s) and {} blob(s), reclaimed {}\n",
            report.layers_removed,
            report.blobs_removed,
            human_size(report.bytes_reclaimed)
        ))
    }

    /// Formats health check results followed by the effective configuration
    pub fn format_health_with_config(
        &self,
        health_results: &BTreeMap<String, HealthStatus>,
        config: &BTreeMap<String, String>,
    ) -> Result<String> {
        if self.format != OutputFormat::Human {
            let output = serde_json::json!({
                "health_status": health_results,
                "configuration": config,
            });
            return self.serialize(&output, "health status");
        }

        let mut output = String::new();
        output.push_str("Build Dependency Health\n");
        output.push_str(RULE);
        output.push_str("\n\n");

        for (name, status) in health_results {
            let status_symbol = if status.available {
                "\u{2713}"
            } else {
                "\u{2717}"
            };
            output.push_str(&format!("{} {}\n", status_symbol, name));
            output.push_str(&format!(
                "  Status: {}\n",
                if status.available {
                    "Available"
                } else {
                    "Unavailable"
                }
            ));
            output.push_str(&format!("  Message: {}\n", status.message));
            if let Some(ref details) = status.details {
                output.push_str(&format!("  Details: {}\n", details));
            }
            output.push('\n');
        }

        output.push_str("Configuration\n");
        output.push_str(RULE);
        output.push_str("\n\n");
        for (key, value) in config {
            output.push_str(&format!("  {:<22} {}\n", key, value));
        }

        Ok(output)
    }
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", size, UNITS[unit])
    }
}

/// Health status for a build-time dependency
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct HealthStatus {
    pub available: bool,
    pub message: String,
    pub details: Option<String>,
}

impl HealthStatus {
    pub fn available(message: String) -> Self {
        Self {
            available: true,
            message,
            details: None,
        }
    }

    pub fn unavailable(message: String) -> Self {
        Self {
            available: false,
            message,
            details: None,
        }
    }

    pub fn with_details(mut self, details: String) -> Self {
        self.details = Some(details);
        self
    }
}
