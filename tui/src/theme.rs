use ddc_orchestrator::Phase;
use ratatui::style::{
    Color,
    Modifier,
    Style,
};

#[derive(Clone, Copy, Debug)]
pub(crate) struct Theme {
    pub(crate) default: Style,
    pub(crate) title: Style,
    pub(crate) dim: Style,
    pub(crate) border: Style,
    pub(crate) warning: Style,
    pub(crate) success: Style,
    pub(crate) failure: Style,
    pub(crate) active: Style,
}

impl Default for Theme {
    fn default() -> Self {
        Self {
            default: Style::default().fg(Color::Gray),
            title: Style::default().fg(Color::White).add_modifier(Modifier::BOLD),
            dim: Style::default().fg(Color::DarkGray),
            border: Style::default().fg(Color::DarkGray),
            warning: Style::default().fg(Color::Yellow),
            success: Style::default().fg(Color::Green),
            failure: Style::default().fg(Color::Red),
            active: Style::default().fg(Color::Cyan),
        }
    }
}

impl Theme {
    pub(crate) fn phase(&self, phase: Phase) -> Style {
        match phase {
            Phase::Completed => self.success,
            Phase::Failed => self.failure,
            Phase::Cancelled => self.warning,
            Phase::Pending => self.dim,
            _ => self.active,
        }
    }
}
