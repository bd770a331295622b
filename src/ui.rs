use ratatui::{
    Frame,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, Paragraph, Wrap},
};
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use crate::app::App;
use crate::foreground::{EntryStatus, Role, TranscriptEntry, WidgetPhase};
use crate::store::Position;

// --- COLOR CONSTANTS ---
const BG_COLOR: Color = Color::Rgb(21, 21, 21);
const TEXT_COLOR: Color = Color::Rgb(220, 220, 220);
const ACCENT_COLOR: Color = Color::Rgb(0, 122, 204);
const BAR_BG_COLOR: Color = Color::Rgb(37, 37, 38);
const MUTED_COLOR: Color = Color::Rgb(128, 128, 128);
const ERROR_COLOR: Color = Color::Rgb(244, 71, 71);

pub const WIDGET_WIDTH: u16 = 48;
pub const WIDGET_HEIGHT: u16 = 18;
pub const MINIMIZED_HEIGHT: u16 = 3;

const KEY_HINTS: &str = " F2 chat  F3 minimize  F5 reload  Tab org  Shift+Tab agent  Ctrl+Q quit ";

/// Where the widget is drawn inside `frame`, or `None` while hidden.
///
/// Without a saved position the widget sits in the bottom-right corner, above
/// the status bar. Saved positions are clamped so the widget stays on screen.
pub fn widget_rect(frame: Rect, phase: WidgetPhase, position: Option<Position>) -> Option<Rect> {
    let height = match phase {
        WidgetPhase::Hidden => return None,
        WidgetPhase::Expanded => WIDGET_HEIGHT,
        WidgetPhase::Minimized => MINIMIZED_HEIGHT,
    };
    let usable_height = frame.height.saturating_sub(1);
    let width = WIDGET_WIDTH.min(frame.width);
    let height = height.min(usable_height);
    let max_x = frame.x + (frame.width - width);
    let max_y = frame.y + (usable_height - height);
    let (x, y) = match position {
        Some(position) => (position.x.clamp(frame.x, max_x), position.y.clamp(frame.y, max_y)),
        None => (max_x, max_y),
    };
    Some(Rect::new(x, y, width, height))
}

/// The header is the top border row; grabbing it starts a drag.
pub fn is_header_hit(area: Rect, column: u16, row: u16) -> bool {
    row == area.y && column >= area.x && column < area.x + area.width
}

pub fn render(app: &mut App, f: &mut Frame) {
    let area = f.size();
    f.render_widget(Block::default().style(Style::default().bg(BG_COLOR)), area);

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(0), Constraint::Length(1)])
        .split(area);
    render_status_bar(app, f, chunks[1]);

    let widget = app.agent.widget();
    let phase = widget.phase();
    app.widget_area = widget_rect(area, phase, widget.state().position);
    let Some(rect) = app.widget_area else {
        return;
    };

    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(ACCENT_COLOR))
        .style(Style::default().bg(BAR_BG_COLOR).fg(TEXT_COLOR))
        .title(Span::styled(
            header_title(app),
            Style::default().add_modifier(Modifier::BOLD),
        ));
    f.render_widget(Clear, rect);
    if phase == WidgetPhase::Minimized {
        f.render_widget(block, rect);
        return;
    }

    let inner = block.inner(rect);
    f.render_widget(block, rect);
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(1), Constraint::Length(1)])
        .split(inner);
    render_transcript(app, f, rows[0]);
    render_input(app, f, rows[1]);
}

fn render_status_bar(app: &App, f: &mut Frame, area: Rect) {
    let mut spans = vec![Span::styled(KEY_HINTS, Style::default().fg(MUTED_COLOR))];
    if !app.status_message.is_empty() {
        spans.push(Span::styled("│ ", Style::default().fg(MUTED_COLOR)));
        spans.push(Span::raw(app.status_message.as_str()));
    }
    let bar = Paragraph::new(Line::from(spans)).style(Style::default().bg(BAR_BG_COLOR).fg(TEXT_COLOR));
    f.render_widget(bar, area);
}

/// "Organization / Agent", falling back to ids until the directory is loaded.
fn header_title(app: &App) -> String {
    let state = app.agent.widget().state();
    let organization = state.selected_organization.as_deref().map(|id| {
        app.agent
            .organizations()
            .iter()
            .find(|org| org.id == id)
            .map(|org| org.name.as_str())
            .unwrap_or(id)
    });
    let agent = state.selected_agent.as_deref().map(|id| {
        app.agent
            .agents()
            .iter()
            .find(|agent| agent.id == id)
            .map(|agent| agent.name.as_str())
            .unwrap_or(id)
    });
    match (organization, agent) {
        (Some(org), Some(agent)) => format!(" {org} / {agent} "),
        (Some(org), None) => format!(" {org} / no agent "),
        _ => String::from(" Assistant "),
    }
}

fn entry_line(entry: &TranscriptEntry) -> Line<'_> {
    let (label, label_color) = match entry.role {
        Role::User => ("You: ", ACCENT_COLOR),
        Role::Assistant => ("Agent: ", Color::Rgb(78, 201, 176)),
    };
    let mut spans = vec![Span::styled(
        label,
        Style::default().fg(label_color).add_modifier(Modifier::BOLD),
    )];
    match entry.status {
        EntryStatus::Streaming if entry.text.is_empty() => {
            spans.push(Span::styled("…", Style::default().fg(MUTED_COLOR)));
        }
        EntryStatus::Streaming => {
            spans.push(Span::raw(entry.text.as_str()));
            spans.push(Span::styled("▌", Style::default().fg(MUTED_COLOR)));
        }
        EntryStatus::Failed => {
            spans.push(Span::styled(entry.text.as_str(), Style::default().fg(ERROR_COLOR)));
        }
        EntryStatus::Cancelled => {
            spans.push(Span::raw(entry.text.as_str()));
            spans.push(Span::styled(" (stopped)", Style::default().fg(MUTED_COLOR)));
        }
        EntryStatus::Done => spans.push(Span::raw(entry.text.as_str())),
    }
    Line::from(spans)
}

/// Rows `lines` occupy once wrapped to `width` columns.
fn wrapped_height(lines: &[Line], width: u16) -> u16 {
    let width = usize::from(width.max(1));
    let rows: usize = lines
        .iter()
        .map(|line| {
            let columns: usize = line.spans.iter().map(|span| span.content.width()).sum();
            columns.max(1).div_ceil(width)
        })
        .sum();
    u16::try_from(rows).unwrap_or(u16::MAX)
}

fn render_transcript(app: &App, f: &mut Frame, area: Rect) {
    let Some(key) = app.agent.active_key() else {
        let hint = Paragraph::new("Pick an organization with Tab and an agent with Shift+Tab.")
            .style(Style::default().fg(MUTED_COLOR))
            .wrap(Wrap { trim: true });
        f.render_widget(hint, area);
        return;
    };
    let transcript = app.agent.conversations().transcript(&key);
    let lines: Vec<Line> = transcript.entries().iter().map(entry_line).collect();
    // Keep the newest text in view.
    let offset = wrapped_height(&lines, area.width).saturating_sub(area.height);
    let paragraph = Paragraph::new(lines)
        .wrap(Wrap { trim: false })
        .scroll((offset, 0));
    f.render_widget(paragraph, area);
}

/// The tail of `text` that fits in `width` columns.
fn visible_tail(text: &str, width: usize) -> &str {
    let mut used = 0;
    let mut start = text.len();
    for (index, ch) in text.char_indices().rev() {
        used += ch.width().unwrap_or(0);
        if used > width {
            break;
        }
        start = index;
    }
    &text[start..]
}

fn render_input(app: &App, f: &mut Frame, area: Rect) {
    let line = if app.agent.is_input_enabled() {
        let room = usize::from(area.width).saturating_sub(3);
        Line::from(vec![
            Span::styled("> ", Style::default().fg(ACCENT_COLOR)),
            Span::raw(visible_tail(&app.input, room)),
            Span::styled("▏", Style::default().fg(ACCENT_COLOR)),
        ])
    } else if app.agent.active_key().is_some() {
        Line::from(Span::styled("Waiting for reply…", Style::default().fg(MUTED_COLOR)))
    } else {
        Line::from(Span::styled("Input disabled", Style::default().fg(MUTED_COLOR)))
    };
    f.render_widget(Paragraph::new(line), area);
}
