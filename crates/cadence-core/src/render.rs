use std::io::{self, IsTerminal, Write};

use anyhow::anyhow;
use unicode_width::UnicodeWidthStr;

use crate::config::Config;
use crate::datetime::CanonicalDate;
use crate::habits::{current_streak, is_completed_on};
use crate::model::{Area, Frequency, Habit, HabitFrequency, Milestone, WorkItem};
use crate::recurrence::{effective_date, is_overdue};

#[derive(Debug, Clone)]
pub struct Renderer {
    color: bool,
}

impl Renderer {
    pub fn new(cfg: &Config) -> anyhow::Result<Self> {
        let color_cfg = cfg.get("color").unwrap_or_else(|| "on".to_string());
        let color = match color_cfg.to_ascii_lowercase().as_str() {
            "on" | "yes" | "true" | "1" => io::stdout().is_terminal(),
            "off" | "no" | "false" | "0" => false,
            other => return Err(anyhow!("invalid color setting: {other}")),
        };

        Ok(Self { color })
    }

    pub fn plain() -> Self {
        Self { color: false }
    }

    /// `visible` is the rendered window of a feed holding `total` items.
    #[tracing::instrument(skip(self, writer, visible))]
    pub fn write_feed<W: Write>(
        &self,
        mut writer: W,
        visible: &[WorkItem],
        total: usize,
        today: CanonicalDate,
    ) -> anyhow::Result<()> {
        if visible.is_empty() {
            writeln!(writer, "Nothing scheduled.")?;
            return Ok(());
        }

        let headers = ["ID", "Date", "Pri", "Title", "Repeats"];
        let rows = visible
            .iter()
            .map(|item| {
                let date = effective_date(item)
                    .map(|date| date.to_string())
                    .unwrap_or_default();
                let date = if is_overdue(item, today) {
                    self.paint(&date, "31")
                } else {
                    date
                };
                let priority = match (item.is_important, item.is_urgent) {
                    (true, true) => "!!",
                    (true, false) => "!",
                    (false, true) => "u",
                    (false, false) => "",
                };
                vec![
                    self.paint(item.id.as_str(), "33"),
                    date,
                    priority.to_string(),
                    item.title.clone(),
                    item.recurrence
                        .as_ref()
                        .map(|rule| describe_repeat(rule.frequency, rule.interval))
                        .unwrap_or_default(),
                ]
            })
            .collect();

        write_table(&mut writer, &headers, rows)?;
        if visible.len() < total {
            writeln!(writer, "{} more", total - visible.len())?;
        }
        Ok(())
    }

    pub fn print_feed(
        &self,
        visible: &[WorkItem],
        total: usize,
        today: CanonicalDate,
    ) -> anyhow::Result<()> {
        self.write_feed(io::stdout().lock(), visible, total, today)
    }

    #[tracing::instrument(skip(self, writer, habits))]
    pub fn write_habits<W: Write>(
        &self,
        mut writer: W,
        habits: &[&Habit],
        day: CanonicalDate,
    ) -> anyhow::Result<()> {
        let headers = ["ID", "Habit", "Schedule", "Done", "Streak"];
        let rows = habits
            .iter()
            .map(|habit| {
                let schedule = match habit.frequency {
                    HabitFrequency::Daily => "daily".to_string(),
                    HabitFrequency::Weekly | HabitFrequency::Custom => habit.selected_days.join(","),
                };
                let done = if is_completed_on(habit, day) {
                    self.paint("yes", "32")
                } else {
                    "no".to_string()
                };
                vec![
                    self.paint(habit.id.as_str(), "33"),
                    habit.name.clone(),
                    schedule,
                    done,
                    current_streak(habit, day).to_string(),
                ]
            })
            .collect();
        write_table(&mut writer, &headers, rows)
    }

    pub fn print_habits(&self, habits: &[&Habit], day: CanonicalDate) -> anyhow::Result<()> {
        self.write_habits(io::stdout().lock(), habits, day)
    }

    pub fn write_milestones<W: Write>(
        &self,
        mut writer: W,
        milestones: &[&Milestone],
    ) -> anyhow::Result<()> {
        let headers = ["ID", "Area", "Milestone", "Progress", "Completed"];
        let rows = milestones
            .iter()
            .map(|m| {
                vec![
                    self.paint(m.id.as_str(), "33"),
                    m.area_id.to_string(),
                    m.title.clone(),
                    format!("{}%", m.progress),
                    m.completed_date.map(|d| d.to_string()).unwrap_or_default(),
                ]
            })
            .collect();
        write_table(&mut writer, &headers, rows)
    }

    pub fn print_milestones(&self, milestones: &[&Milestone]) -> anyhow::Result<()> {
        self.write_milestones(io::stdout().lock(), milestones)
    }

    pub fn print_areas(&self, areas: &[Area]) -> anyhow::Result<()> {
        let headers = ["ID", "Area", "Color", "Icon"];
        let rows = areas
            .iter()
            .map(|area| {
                vec![
                    self.paint(area.id.as_str(), "33"),
                    area.name.clone(),
                    area.color.clone(),
                    area.icon.clone(),
                ]
            })
            .collect();
        write_table(io::stdout().lock(), &headers, rows)
    }

    fn paint(&self, text: &str, code: &str) -> String {
        if !self.color {
            return text.to_string();
        }
        format!("\x1b[{code}m{text}\x1b[0m")
    }
}

fn describe_repeat(frequency: Frequency, interval: u32) -> String {
    let unit = match frequency {
        Frequency::Daily => "day",
        Frequency::Weekly => "week",
        Frequency::Monthly => "month",
        Frequency::Yearly => "year",
    };
    if interval <= 1 {
        format!("every {unit}")
    } else {
        format!("every {interval} {unit}s")
    }
}

fn write_table<W: Write>(
    mut writer: W,
    headers: &[&str],
    rows: Vec<Vec<String>>,
) -> anyhow::Result<()> {
    let mut widths: Vec<usize> = headers.iter().map(|h| UnicodeWidthStr::width(*h)).collect();

    for row in &rows {
        for (idx, cell) in row.iter().enumerate() {
            widths[idx] = widths[idx].max(UnicodeWidthStr::width(strip_ansi(cell).as_str()));
        }
    }

    for (header, width) in headers.iter().zip(widths.iter().copied()) {
        write!(writer, "{header:width$} ")?;
    }
    writeln!(writer)?;

    for &width in &widths {
        write!(writer, "{:-<width$} ", "")?;
    }
    writeln!(writer)?;

    for row in rows {
        for (cell, width) in row.iter().zip(widths.iter().copied()) {
            let visible_width = UnicodeWidthStr::width(strip_ansi(cell).as_str());
            let padding = width.saturating_sub(visible_width);
            write!(writer, "{}{} ", cell, " ".repeat(padding))?;
        }
        writeln!(writer)?;
    }

    Ok(())
}

fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut escaped = false;

    for ch in s.chars() {
        if escaped {
            if ch == 'm' {
                escaped = false;
            }
            continue;
        }

        if ch == '\x1b' {
            escaped = true;
            continue;
        }

        out.push(ch);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::{Renderer, strip_ansi, write_table};
    use crate::datetime::CanonicalDate;
    use crate::model::{EntityId, WorkItem};

    #[test]
    fn table_pads_by_display_width() {
        let mut out = Vec::new();
        write_table(
            &mut out,
            &["ID", "Title"],
            vec![
                vec!["\x1b[33m1\x1b[0m".to_string(), "日本".to_string()],
                vec!["22".to_string(), "x".to_string()],
            ],
        )
        .expect("write table");
        let text = String::from_utf8(out).expect("utf8");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(strip_ansi(lines[2]), "1  日本  ");
        assert_eq!(lines[3], "22 x     ");
    }

    #[test]
    fn feed_reports_hidden_rows() {
        let today = CanonicalDate::from_ymd(2026, 10, 16).expect("valid date");
        let items: Vec<WorkItem> = (0..3)
            .map(|n| {
                let mut item = WorkItem::new(EntityId::new(n.to_string()), format!("{n}/3 step"));
                item.scheduled_date = Some(today);
                item
            })
            .collect();

        let mut out = Vec::new();
        Renderer::plain()
            .write_feed(&mut out, &items[..2], items.len(), today)
            .expect("write feed");
        let text = String::from_utf8(out).expect("utf8");
        assert!(text.contains("0/3 step"));
        assert!(!text.contains("2/3 step"));
        assert!(text.trim_end().ends_with("1 more"));
    }
}
