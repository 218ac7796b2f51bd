use std::io::{self, Write};
use std::path::Path;

use crate::accessibility::{AccessibilityResult, Impact};
use crate::flow::FlowResult;
use crate::smoke::{RouteResult, ScreenshotResult};
use crate::visual::ScreenshotOutcome;

pub fn format_diff_percent(percent: f64) -> String {
    if percent < 0.01 {
        "<0.01%".to_string()
    } else {
        format!("{:.2}%", percent)
    }
}

/// Shortens `text` to at most `max` characters, ending in `…` when cut.
pub fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut shortened: String = text.chars().take(max.saturating_sub(1)).collect();
    shortened.push('…');
    shortened
}

pub fn write_header(out: &mut impl Write, name: &str, port: u16) -> io::Result<()> {
    writeln!(out)?;
    writeln!(out, "🔍 {} (localhost:{})", name, port)?;
    writeln!(out, "{}", "=".repeat(name.chars().count() + 20))
}

fn screenshot_badge(screenshot: &ScreenshotResult) -> String {
    let width = screenshot.width;
    match &screenshot.outcome {
        Some(ScreenshotOutcome::BaselineCreated) => format!("{} 🆕", width),
        Some(ScreenshotOutcome::BaselineUpdated) | None => format!("{} 📸", width),
        Some(ScreenshotOutcome::Compared(comparison)) if comparison.matched => {
            format!("{} ✅", width)
        }
        Some(ScreenshotOutcome::Compared(comparison))
            if comparison.is_dimension_mismatch() =>
        {
            format!("{} ❌ resize", width)
        }
        Some(ScreenshotOutcome::Compared(comparison)) => {
            format!("{} ❌ {}", width, format_diff_percent(comparison.diff_percent))
        }
    }
}

fn icon(passed: bool) -> &'static str {
    if passed { "✅" } else { "❌" }
}

pub fn write_smoke_results(
    out: &mut impl Write,
    results: &[RouteResult],
) -> io::Result<()> {
    writeln!(out)?;
    writeln!(out, "📄 SMOKE TESTS")?;
    for result in results {
        writeln!(
            out,
            "  {:<24} {} {}ms",
            result.route,
            icon(result.passed),
            result.duration_ms
        )?;
        if result.timed_out {
            writeln!(out, "    ⏱️  Timed out")?;
        }
        if result.is_blank {
            writeln!(out, "    📭 Page is blank")?;
        }
        for error in &result.console_errors {
            writeln!(out, "    ⚠️  {}", truncate(error, 80))?;
        }
        for failure in &result.network_failures {
            writeln!(out, "    🌐 {}", truncate(failure, 80))?;
        }
        if !result.screenshots.is_empty() {
            let badges: Vec<String> =
                result.screenshots.iter().map(screenshot_badge).collect();
            writeln!(out, "    {}", badges.join("  "))?;
        }
    }
    Ok(())
}

fn impact_marker(impact: Option<Impact>) -> &'static str {
    match impact {
        Some(Impact::Critical | Impact::Serious) => "🔴",
        Some(Impact::Moderate) => "🟡",
        Some(Impact::Minor) | None => "🟢",
    }
}

pub fn write_a11y_results(
    out: &mut impl Write,
    results: &[AccessibilityResult],
) -> io::Result<()> {
    if results.is_empty() {
        return Ok(());
    }
    writeln!(out)?;
    writeln!(out, "♿ ACCESSIBILITY (WCAG 2.1 AA)")?;
    for result in results {
        if let Some(error) = &result.error {
            writeln!(out, "  {:<24} ❌ {}ms", result.route, result.duration_ms)?;
            writeln!(out, "    ⚠️  {}", truncate(error, 80))?;
            continue;
        }
        if result.passed {
            writeln!(out, "  {:<24} ✅ {}ms", result.route, result.duration_ms)?;
            continue;
        }
        writeln!(
            out,
            "  {:<24} ❌ {}ms  {} violations, {} elements",
            result.route,
            result.duration_ms,
            result.violation_count,
            result.affected_node_count
        )?;
        for violation in &result.violations {
            let impact = violation
                .impact
                .map(|impact| impact.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            writeln!(
                out,
                "    {} {} ({}) × {}",
                impact_marker(violation.impact),
                violation.rule_id,
                impact,
                violation.affected_nodes
            )?;
            writeln!(out, "       {}", violation.description)?;
            if let Some(target) = &violation.first_target {
                writeln!(out, "       → {}", target)?;
            }
        }
    }
    Ok(())
}

pub fn write_flow_results(
    out: &mut impl Write,
    results: &[FlowResult],
) -> io::Result<()> {
    if results.is_empty() {
        return Ok(());
    }
    writeln!(out)?;
    writeln!(out, "🔗 FLOW TESTS")?;
    for flow in results {
        writeln!(out, "  {} {}", icon(flow.passed), flow.name)?;
        if let Some(error) = &flow.error {
            writeln!(out, "    ⚠️  {}", truncate(error, 70))?;
        }
        for (index, step) in flow.steps.iter().enumerate() {
            let timing = if step.duration_ms > 0 {
                format!(" {}ms", step.duration_ms)
            } else {
                String::new()
            };
            writeln!(
                out,
                "    {}. {:<24} {}{}",
                index + 1,
                step.label,
                icon(step.passed),
                timing
            )?;
            if let Some(error) = &step.error {
                writeln!(out, "       ⚠️  {}", truncate(error, 70))?;
            }
        }
    }
    Ok(())
}

/// Everything one project run produced.
pub struct RunReport<'a> {
    pub smoke: &'a [RouteResult],
    pub a11y: &'a [AccessibilityResult],
    pub flows: &'a [FlowResult],
    pub output_dir: Option<&'a Path>,
}

impl RunReport<'_> {
    pub fn total(&self) -> usize {
        self.smoke.len() + self.a11y.len() + self.flows.len()
    }

    pub fn passed(&self) -> usize {
        self.smoke.iter().filter(|r| r.passed).count()
            + self.a11y.iter().filter(|r| r.passed).count()
            + self.flows.iter().filter(|r| r.passed).count()
    }

    pub fn all_passed(&self) -> bool {
        self.passed() == self.total()
    }

    pub fn write_summary(&self, out: &mut impl Write) -> io::Result<()> {
        let (passed, total) = (self.passed(), self.total());
        writeln!(out)?;
        if passed == total {
            writeln!(out, "RESULTS: 🎉 {}/{} passed", passed, total)?;
        } else {
            writeln!(
                out,
                "RESULTS: 💥 {}/{} passed, {} failed",
                passed,
                total,
                total - passed
            )?;
        }
        self.write_screenshot_summary(out)?;
        self.write_a11y_summary(out)?;
        if let Some(dir) = self.output_dir {
            writeln!(out, "Output: {}", dir.display())?;
        }
        writeln!(out)
    }

    fn write_screenshot_summary(&self, out: &mut impl Write) -> io::Result<()> {
        let screenshots: Vec<&ScreenshotResult> = self
            .smoke
            .iter()
            .flat_map(|result| &result.screenshots)
            .collect();
        if screenshots.is_empty() {
            return Ok(());
        }

        let count = |wanted: fn(&ScreenshotOutcome) -> bool| {
            screenshots
                .iter()
                .filter(|shot| shot.outcome.as_ref().is_some_and(wanted))
                .count()
        };
        let created = count(|o| matches!(o, ScreenshotOutcome::BaselineCreated));
        let updated = count(|o| matches!(o, ScreenshotOutcome::BaselineUpdated));
        let compared = count(|o| matches!(o, ScreenshotOutcome::Compared(_)));
        let matched =
            count(|o| matches!(o, ScreenshotOutcome::Compared(c) if c.matched));

        writeln!(out, "Screenshots: {} total", screenshots.len())?;
        if created > 0 {
            writeln!(out, "  🆕 No baselines found, created {} baselines", created)?;
        }
        if updated > 0 {
            writeln!(out, "  📸 Updated {} baselines", updated)?;
        }
        if compared > 0 {
            writeln!(
                out,
                "  🔍 Compared {}: {} matched, {} failed",
                compared,
                matched,
                compared - matched
            )?;
        }
        for shot in &screenshots {
            let Some(ScreenshotOutcome::Compared(comparison)) = &shot.outcome else {
                continue;
            };
            if comparison.matched {
                continue;
            }
            match (&comparison.mismatch, &comparison.diff_path) {
                (Some(mismatch), _) => writeln!(
                    out,
                    "    ❌ {}: dimension mismatch ({} vs {})",
                    shot.filename, mismatch.current, mismatch.baseline
                )?,
                (None, Some(diff_path)) => writeln!(
                    out,
                    "    ❌ {}: {} diff → {}",
                    shot.filename,
                    format_diff_percent(comparison.diff_percent),
                    diff_path.display()
                )?,
                (None, None) => writeln!(
                    out,
                    "    ❌ {}: {} diff",
                    shot.filename,
                    format_diff_percent(comparison.diff_percent)
                )?,
            }
        }
        Ok(())
    }

    fn write_a11y_summary(&self, out: &mut impl Write) -> io::Result<()> {
        if self.a11y.is_empty() {
            return Ok(());
        }
        let clean = self.a11y.iter().filter(|r| r.passed).count();
        let violations: usize = self.a11y.iter().map(|r| r.violation_count).sum();
        let nodes: usize = self.a11y.iter().map(|r| r.affected_node_count).sum();
        if violations == 0 {
            writeln!(
                out,
                "Accessibility: {}/{} routes clean",
                clean,
                self.a11y.len()
            )
        } else {
            writeln!(
                out,
                "Accessibility: {}/{} routes clean, {} violations across {} elements",
                clean,
                self.a11y.len(),
                violations,
                nodes
            )
        }
    }
}
