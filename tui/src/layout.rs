use eyre::{
    bail,
    Result,
};
use ratatui::{
    layout::{
        Constraint,
        Direction,
        Layout,
    },
    prelude::Rect,
};

/// Split the screen: header, node table, executor line, warnings.
pub(crate) fn dashboard_areas(area: Rect, coordinator_rows: u16) -> Result<[Rect; 4]> {
    let constraints = vec![
        Constraint::Length(4),                      // Header
        Constraint::Length(coordinator_rows + 3),  // Coordinators, with borders and header row
        Constraint::Length(3),                      // Executors
        Constraint::Min(0),                         // Warnings and output
    ];

    let [header, nodes, executors, tail] = *Layout::default()
        .direction(Direction::Vertical)
        .constraints(constraints)
        .split(area)
    else {
        bail!("Failed to split the area");
    };

    Ok([header, nodes, executors, tail])
}
