use crate::{
    layout::dashboard_areas,
    theme::Theme,
};
use chrono::Utc;
use ddc_orchestrator::{
    NodeState,
    Phase,
    StatusSnapshot,
};
use eyre::Result;
use ratatui::{
    layout::Constraint,
    text::{
        Line,
        Span,
    },
    widgets::{
        Block,
        Borders,
        Paragraph,
        Row,
        Table,
        Wrap,
    },
    Frame,
};
use strum::IntoEnumIterator as _;

/// `HH:MM:SS`, hours unbounded.
pub fn format_elapsed(secs: u64) -> String {
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

fn time_in_phase(node: &NodeState) -> u64 {
    let end = node.phase_ended_at.unwrap_or_else(Utc::now);
    (end - node.phase_started_at).num_seconds().max(0) as u64
}

/// `3 collecting, 9 done` for the phases with at least one executor in them.
pub fn executor_breakdown(snapshot: &StatusSnapshot) -> String {
    let parts: Vec<String> = Phase::iter()
        .filter_map(|phase| {
            let count = snapshot.executors().filter(|n| n.phase == phase).count();
            (count > 0).then(|| format!("{count} {}", phase.ux()))
        })
        .collect();
    if parts.is_empty() {
        "none".to_string()
    } else {
        parts.join(", ")
    }
}

/// Plain-text outcome, printed once the dashboard is gone.
pub fn final_report(snapshot: &StatusSnapshot) -> String {
    let mut lines = vec![format!(
        "collection {} after {}",
        snapshot.result.as_deref().unwrap_or("incomplete"),
        format_elapsed(snapshot.runtime_secs)
    )];
    for file in &snapshot.output_files {
        lines.push(format!("  archive: {file}"));
    }
    for node in snapshot.failed() {
        lines.push(format!(
            "  {} {}: {}",
            node.name,
            node.phase,
            node.error_message.as_deref().unwrap_or("no details")
        ));
    }
    lines.join("\n")
}

#[derive(Debug, Default)]
pub struct Dashboard {
    theme: Theme,
}

impl Dashboard {
    pub fn draw(&self, frame: &mut Frame<'_>, snapshot: &StatusSnapshot) -> Result<()> {
        let theme = &self.theme;
        let coordinators: Vec<&NodeState> = snapshot.coordinators().collect();
        let [header, nodes, executors, tail] = dashboard_areas(frame.area(), coordinators.len() as u16)?;

        let executor_count = snapshot.executors().count();
        let failed = snapshot.failed().count();
        let header_lines = vec![
            Line::from(vec![
                Span::styled("Dremio diagnostic collection", theme.title),
                Span::styled(format!("   elapsed {}", format_elapsed(snapshot.runtime_secs)), theme.default),
            ]),
            Line::styled(
                format!(
                    "transfers {}/{}   nodes {} ({} coordinators, {executor_count} executors)   failed {failed}",
                    snapshot.transfers_done,
                    snapshot.transfers_attempted,
                    snapshot.nodes.len(),
                    coordinators.len(),
                ),
                if failed > 0 { theme.warning } else { theme.default },
            ),
            Line::styled(
                format!("output: {}", snapshot.tarball_dir.as_deref().unwrap_or("pending")),
                theme.dim,
            ),
            Line::styled("ctrl-c cancels the collection", theme.dim),
        ];
        frame.render_widget(Paragraph::new(header_lines), header);

        let rows = coordinators.iter().map(|node| {
            Row::new(vec![
                Span::styled(node.name.clone(), theme.default),
                Span::styled(node.phase.ux(), theme.phase(node.phase)),
                Span::styled(format_elapsed(time_in_phase(node)), theme.dim),
                Span::styled(node.error_message.clone().unwrap_or_default(), theme.failure),
            ])
        });
        let table = Table::new(
            rows,
            [
                Constraint::Percentage(30),
                Constraint::Length(28),
                Constraint::Length(10),
                Constraint::Min(10),
            ],
        )
        .header(Row::new(vec!["coordinator", "status", "in phase", "error"]).style(theme.title))
        .block(Block::default().borders(Borders::ALL).border_style(theme.border).title("coordinators"));
        frame.render_widget(table, nodes);

        let executor_line = Paragraph::new(format!("{executor_count} executors: {}", executor_breakdown(snapshot)))
            .style(theme.default)
            .block(Block::default().borders(Borders::ALL).border_style(theme.border).title("executors"));
        frame.render_widget(executor_line, executors);

        let mut lines: Vec<Line<'_>> = Vec::new();
        if let Some(result) = &snapshot.result {
            let style = if result == "success" { theme.success } else { theme.failure };
            lines.push(Line::styled(format!("result: {result}"), style));
            lines.extend(snapshot.output_files.iter().map(|f| Line::styled(format!("archive: {f}"), theme.default)));
        }
        let room = (tail.height as usize).saturating_sub(2 + lines.len());
        let skip = snapshot.warnings.len().saturating_sub(room);
        lines.extend(
            snapshot.warnings[skip..]
                .iter()
                .map(|w| Line::styled(w.clone(), theme.warning)),
        );
        let messages = Paragraph::new(lines)
            .wrap(Wrap { trim: true })
            .block(Block::default().borders(Borders::ALL).border_style(theme.border).title("messages"));
        frame.render_widget(messages, tail);
        Ok(())
    }
}
