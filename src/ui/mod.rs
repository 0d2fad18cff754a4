use anyhow::Error;
use std::io::{self, Write};
use unicode_width::UnicodeWidthChar;

use crate::core::{LocalImage, Severity, VulnerabilitySummary};
use crate::db::DatabaseStatus;

#[derive(Debug, Clone)]
pub struct UiConfig {
    pub color: bool,
    pub stderr_is_tty: bool,
    pub quiet: bool,
}

/// One row of a batch report: the image and either its summary or an error line.
pub type BatchRow<'a> = (&'a str, Result<Option<VulnerabilitySummary>, String>);

pub fn eprintln_error(err: &Error) {
    let mut stderr = io::stderr().lock();
    let _ = writeln!(stderr, "error:");
    let _ = writeln!(stderr, "  {err}");

    let mut causes = err.chain().skip(1).peekable();
    if causes.peek().is_some() {
        let _ = writeln!(stderr, "caused by:");
        for cause in causes {
            let _ = writeln!(stderr, "  - {cause}");
        }
    }

    let _ = writeln!(stderr, "next:");
    let _ = writeln!(stderr, "  - re-run with `--verbose` for details");
    let _ = writeln!(
        stderr,
        "  - see `trivy-offline --help` for available commands and options"
    );
}

pub fn print_summary(image: &str, summary: &VulnerabilitySummary, cfg: &UiConfig) {
    let mut out = io::stdout().lock();
    let _ = write_summary(&mut out, image, summary, cfg.color);
}

pub fn write_summary(
    out: &mut dyn Write,
    image: &str,
    summary: &VulnerabilitySummary,
    color: bool,
) -> io::Result<()> {
    writeln!(out)?;
    writeln!(out, "Vulnerability Summary for {image}:")?;
    for severity in Severity::ALL {
        let label = pad_end_display(&format!("{severity}:"), 10);
        writeln!(
            out,
            "  {}{}",
            paint_severity(severity, &label, color && summary.count(severity) > 0),
            summary.count(severity)
        )?;
    }
    writeln!(out, "  {}{}", pad_end_display("TOTAL:", 10), summary.total)
}

pub fn print_batch(rows: &[BatchRow<'_>], cfg: &UiConfig) {
    let mut out = io::stdout().lock();
    let _ = write_batch(&mut out, rows, cfg.color);
}

pub fn write_batch(out: &mut dyn Write, rows: &[BatchRow<'_>], color: bool) -> io::Result<()> {
    let label_image = "IMAGE";
    let image_w = rows
        .iter()
        .map(|(image, _)| visible_width_ansi(image))
        .max()
        .unwrap_or(0)
        .max(visible_width_ansi(label_image));

    let mut header = pad_end_display(label_image, image_w);
    for severity in Severity::ALL {
        header.push_str("  ");
        header.push_str(&pad_start_display(severity.as_str(), 8));
    }
    header.push_str("  ");
    header.push_str(&pad_start_display("TOTAL", 6));
    writeln!(out, "{header}")?;
    writeln!(out, "{}", "-".repeat(visible_width_ansi(&header)))?;

    for (image, result) in rows {
        let mut line = pad_end_display(image, image_w);
        match result {
            Ok(Some(summary)) => {
                for severity in Severity::ALL {
                    let n = summary.count(severity);
                    let cell = pad_start_display(&n.to_string(), 8);
                    line.push_str("  ");
                    line.push_str(&paint_severity(severity, &cell, color && n > 0));
                }
                line.push_str("  ");
                line.push_str(&pad_start_display(&summary.total.to_string(), 6));
            }
            Ok(None) => line.push_str("  ok"),
            Err(err) => {
                line.push_str("  ");
                line.push_str(&paint("31", &format!("FAILED: {}", first_line(err)), color));
            }
        }
        writeln!(out, "{line}")?;
    }
    Ok(())
}

pub fn print_images(images: &[LocalImage], cfg: &UiConfig) {
    let mut out = io::stdout().lock();
    let _ = write_images(&mut out, images, cfg.quiet);
}

pub fn write_images(out: &mut dyn Write, images: &[LocalImage], quiet: bool) -> io::Result<()> {
    if !quiet {
        writeln!(out)?;
        writeln!(out, "Local Docker Images:")?;
    }
    let tag_w = images
        .iter()
        .map(|i| visible_width_ansi(&i.tag))
        .max()
        .unwrap_or(0)
        .clamp(visible_width_ansi("IMAGE"), 50);
    let size_w = images
        .iter()
        .map(|i| format_size_mb(i.size).len())
        .max()
        .unwrap_or(0)
        .max(4);

    let header = format!(
        "{}  {}  {}  CREATED",
        pad_end_display("IMAGE", tag_w),
        pad_end_display("ID", 12),
        pad_start_display("SIZE", size_w)
    );
    writeln!(out, "{header}")?;
    writeln!(out, "{}", "-".repeat(visible_width_ansi(&header).max(80)))?;

    for image in images {
        writeln!(
            out,
            "{}  {}  {}  {}",
            pad_end_display(&truncate_middle(&image.tag, tag_w), tag_w),
            pad_end_display(&image.id, 12),
            pad_start_display(&format_size_mb(image.size), size_w),
            image.created
        )?;
    }
    Ok(())
}

pub fn print_status(status: &DatabaseStatus, cfg: &UiConfig) {
    let mut out = io::stdout().lock();
    let _ = writeln!(out, "Database: {}", status.path);
    if !status.present {
        let _ = writeln!(
            out,
            "  {}",
            paint("33", "not found (run `trivy-offline setup`)", cfg.color)
        );
        return;
    }
    let _ = writeln!(
        out,
        "  files={}  size={}{}",
        status.files,
        format_bytes(status.bytes),
        if status.errors > 0 {
            format!("  errors={}", status.errors)
        } else {
            String::new()
        }
    );
    if let Some(meta) = &status.metadata {
        if let Some(version) = meta.version {
            let _ = writeln!(out, "  version:     {version}");
        }
        if let Some(updated_at) = &meta.updated_at {
            let _ = writeln!(out, "  updated at:  {updated_at}");
        }
        if let Some(next_update) = &meta.next_update {
            let _ = writeln!(out, "  next update: {next_update}");
        }
        if let Some(downloaded_at) = &meta.downloaded_at {
            let _ = writeln!(out, "  downloaded:  {downloaded_at}");
        }
    }
}

fn first_line(s: &str) -> &str {
    s.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("")
}

fn truncate_middle(s: &str, max_chars: usize) -> String {
    let len = s.chars().count();
    if len <= max_chars {
        return s.to_string();
    }

    let keep = max_chars.saturating_sub(3);
    let left = keep / 2;
    let right = keep.saturating_sub(left);

    let prefix: String = s.chars().take(left).collect();
    let suffix: String = s
        .chars()
        .rev()
        .take(right)
        .collect::<String>()
        .chars()
        .rev()
        .collect();

    format!("{prefix}...{suffix}")
}

fn paint_severity(severity: Severity, s: &str, color: bool) -> String {
    let code = match severity {
        Severity::Critical => "31",
        Severity::High => "91",
        Severity::Medium => "33",
        Severity::Low => "32",
        Severity::Unknown => "90",
    };
    paint(code, s, color)
}

fn paint(code: &str, s: &str, color: bool) -> String {
    if !color {
        return s.to_string();
    }
    format!("\x1b[{code}m{s}\x1b[0m")
}

fn pad_end_display(s: &str, width: usize) -> String {
    let w = visible_width_ansi(s);
    if w >= width {
        return s.to_string();
    }
    format!("{s}{}", " ".repeat(width - w))
}

fn pad_start_display(s: &str, width: usize) -> String {
    let w = visible_width_ansi(s);
    if w >= width {
        return s.to_string();
    }
    format!("{}{}", " ".repeat(width - w), s)
}

fn visible_width_ansi(s: &str) -> usize {
    let mut width: usize = 0;
    let mut chars = s.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '\x1b' && chars.peek() == Some(&'[') {
            let _ = chars.next();
            for ch2 in chars.by_ref() {
                if ch2 == 'm' {
                    break;
                }
            }
            continue;
        }
        width = width.saturating_add(UnicodeWidthChar::width(ch).unwrap_or(0));
    }
    width
}

/// Image sizes the way `list` prints them: mebibytes with one decimal.
pub fn format_size_mb(bytes: u64) -> String {
    format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
}

pub fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    const TB: f64 = GB * 1024.0;

    let b = bytes as f64;
    if b < KB {
        return format!("{bytes} B");
    }
    if b < MB {
        return format!("{:.1} KiB", b / KB);
    }
    if b < GB {
        return format!("{:.1} MiB", b / MB);
    }
    if b < TB {
        return format!("{:.1} GiB", b / GB);
    }
    format!("{:.1} TiB", b / TB)
}
