//! Markdown rendering of an aggregated day.
//!
//! Sections always appear in the same order; a section with nothing to show
//! is left out entirely.

use std::fmt::Write;

use chrono::NaiveDate;

use crate::aggregate::DaySummary;

/// Render the report text.
pub fn render(date: NaiveDate, summary: &DaySummary) -> String {
    let mut out = String::new();

    // `write!` into a String cannot fail.
    let _ = writeln!(out, "# Daily Digest: {}", date.format("%A, %B %-d, %Y"));
    out.push('\n');

    let _ = writeln!(
        out,
        "**Active time:** {}{}",
        format_duration(summary.active_secs),
        if summary.active_estimated {
            " (estimated)"
        } else {
            ""
        }
    );

    if !summary.top_sites.is_empty() {
        section(&mut out, "Top Sites");
        for site in &summary.top_sites {
            let _ = write!(
                out,
                "- {} ({} {}",
                site.domain,
                site.visits,
                plural(site.visits, "visit")
            );
            if let Some(secs) = site.dwell_secs {
                let _ = write!(out, ", {}", format_duration(secs));
            }
            out.push_str(")\n");
        }
    }

    if !summary.categories.is_empty() {
        section(&mut out, "Categories");
        for line in &summary.categories {
            let _ = writeln!(
                out,
                "- {}: {} {} ({})",
                line.category.label(),
                line.visits,
                plural(line.visits, "visit"),
                line.top_domains.join(", ")
            );
        }
    }

    if !summary.bookmarks.is_empty() {
        section(&mut out, "Bookmarked");
        for bookmark in &summary.bookmarks {
            let _ = write!(out, "- {}", bookmark.title);
            if !bookmark.url.is_empty() && bookmark.url != bookmark.title {
                let _ = write!(out, " <{}>", bookmark.url);
            }
            if let Some(folder) = &bookmark.folder {
                let _ = write!(out, " in {}", folder);
            }
            out.push('\n');
        }
    }

    if !summary.downloads.is_empty() {
        section(&mut out, "Downloads");
        for download in &summary.downloads {
            let _ = write!(out, "- {}", download.filename);
            if let Some(bytes) = download.size_bytes {
                let _ = write!(out, " ({:.1} MB)", bytes as f64 / (1024.0 * 1024.0));
            }
            out.push('\n');
        }
    }

    if !summary.reading.is_empty() {
        section(&mut out, "Reading");
        for entry in &summary.reading {
            let title = if entry.title.is_empty() {
                entry.url.as_str()
            } else {
                entry.title.as_str()
            };
            let _ = writeln!(out, "### {} ({} min)", title, minutes(entry.time_spent_secs));
            let _ = writeln!(out, "{}", entry.url);

            let byline: Vec<&str> = [entry.meta.author.as_deref(), entry.meta.publish_date.as_deref()]
                .into_iter()
                .flatten()
                .collect();
            if !byline.is_empty() {
                let _ = writeln!(out, "*{}*", byline.join(", "));
            }
            if !entry.text.is_empty() {
                out.push('\n');
                let _ = writeln!(out, "{}", entry.text);
            }
            out.push('\n');
        }
    }

    section(&mut out, "Activity");
    if !summary.peak_hours.is_empty() {
        let hours: Vec<String> = summary
            .peak_hours
            .iter()
            .map(|(hour, count)| format!("{:02}:00 ({})", hour, count))
            .collect();
        let _ = writeln!(out, "- Peak hours: {}", hours.join(", "));
    }
    let _ = writeln!(out, "- Page loads: {}", summary.page_loads);
    let _ = writeln!(out, "- Comebacks: {}", summary.comebacks);

    out
}

fn section(out: &mut String, title: &str) {
    let _ = write!(out, "\n## {}\n", title);
}

fn plural(n: u32, word: &str) -> String {
    if n == 1 {
        word.to_string()
    } else {
        format!("{}s", word)
    }
}

/// Whole minutes, rounded, never zero for a non-zero duration.
fn minutes(secs: u64) -> u64 {
    if secs == 0 {
        0
    } else {
        ((secs + 30) / 60).max(1)
    }
}

/// `1h 05m`, `12m` or `40s`.
pub fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let mins = (secs % 3600) / 60;
    match (hours, mins) {
        (0, 0) => format!("{}s", secs),
        (0, m) => format!("{}m", m),
        (h, m) => format!("{}h {:02}m", h, m),
    }
}
