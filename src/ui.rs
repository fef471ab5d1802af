use ratatui::{
    buffer::Buffer,
    layout::{Alignment, Constraint, Direction, Layout, Position, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, Paragraph, Widget, Wrap},
    Frame,
};
use unicode_width::UnicodeWidthStr;

use timebox::{
    backend::OutputKind,
    controller::{BackendStatus, NoticeLevel},
    session::SessionState,
    surface::EditorSurface,
};

use crate::App;

const GUTTER_WIDTH: u16 = 5;
const OUTPUT_HEIGHT_PERCENT: u16 = 35;

const KEY_HINTS: &str =
    "^S start  ^R/F5 run  ^U submit  ^L clear  ^T/F2 language  ^K forget solved  Esc quit";

/// `m:ss`
pub fn format_remaining(secs: u64) -> String {
    format!("{}:{:02}", secs / 60, secs % 60)
}

struct Areas {
    header: Rect,
    editor: Rect,
    output: Rect,
    footer: Rect,
}

fn areas(area: Rect) -> Areas {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(1),
            Constraint::Min(5),
            Constraint::Percentage(OUTPUT_HEIGHT_PERCENT),
            Constraint::Length(2),
        ])
        .split(area);
    Areas {
        header: chunks[0],
        editor: chunks[1],
        output: chunks[2],
        footer: chunks[3],
    }
}

/// Rows available for text inside a bordered block
fn inner_height(area: Rect) -> usize {
    area.height.saturating_sub(2) as usize
}

fn editor_offset(cursor_row: usize, area: Rect) -> usize {
    let visible = inner_height(area).max(1);
    cursor_row.saturating_sub(visible - 1)
}

pub fn draw(app: &App, f: &mut Frame) {
    let area = f.area();
    f.render_widget(app, area);

    let surface = app.controller.surface();
    if surface.is_editable() && app.controller.status() != &BackendStatus::Loading {
        let editor = areas(area).editor;
        let (row, col) = surface.cursor();
        let line = &surface.lines()[row];
        let prefix: String = line.chars().take(col).collect();
        let x = editor.x + 1 + GUTTER_WIDTH + prefix.width() as u16;
        let y = editor.y + 1 + (row - editor_offset(row, editor)) as u16;
        if x < editor.right().saturating_sub(1) && y < editor.bottom().saturating_sub(1) {
            f.set_cursor_position(Position::new(x, y));
        }
    }
}

impl Widget for &App {
    fn render(self, area: Rect, buf: &mut Buffer) {
        let controller = &self.controller;
        let bold_style = Style::default().add_modifier(Modifier::BOLD);
        let dim_style = Style::default().add_modifier(Modifier::DIM);
        let red_style = Style::default().fg(Color::Red);
        let green_style = Style::default().fg(Color::Green);

        let Areas {
            header,
            editor,
            output,
            footer,
        } = areas(area);

        // header
        let (state_text, state_style) = match controller.state() {
            SessionState::NotStarted => ("not started".to_string(), dim_style),
            SessionState::Started => {
                let remaining = controller.remaining_secs().unwrap_or(0);
                let style = if remaining <= 30 {
                    red_style.patch(bold_style)
                } else {
                    bold_style
                };
                (format!("{} left", format_remaining(remaining)), style)
            }
            SessionState::Waiting => (
                "waiting for cooldown".to_string(),
                Style::default().fg(Color::Yellow),
            ),
            SessionState::Expired => ("time is up".to_string(), red_style.patch(bold_style)),
            SessionState::Solved => ("solved".to_string(), green_style.patch(bold_style)),
        };
        let status_text = match controller.status() {
            BackendStatus::Loading => "loading".to_string(),
            BackendStatus::Ready if controller.is_running() => "running".to_string(),
            BackendStatus::Ready => "ready".to_string(),
            BackendStatus::Failed(_) => "unavailable".to_string(),
        };
        let language_style = if controller.language_selector_enabled() {
            Style::default().fg(Color::Magenta)
        } else {
            dim_style
        };
        Paragraph::new(Line::from(vec![
            Span::styled(format!(" {} ", controller.problem_id()), bold_style),
            Span::raw("│ "),
            Span::styled(state_text, state_style),
            Span::raw(" │ "),
            Span::styled(controller.language().label(), language_style),
            Span::raw(" │ "),
            Span::styled(status_text, dim_style),
        ]))
        .render(header, buf);

        // editor
        let surface = controller.surface();
        let editor_block = Block::default()
            .borders(Borders::ALL)
            .title(if surface.is_editable() {
                " Code "
            } else {
                " Code (read-only) "
            });
        let editor_lines: Vec<Line> = match surface.placeholder() {
            Some(placeholder) if surface.is_empty() => vec![Line::from(Span::styled(
                placeholder.to_string(),
                dim_style.add_modifier(Modifier::ITALIC),
            ))],
            _ => {
                let offset = editor_offset(surface.cursor().0, editor);
                surface
                    .lines()
                    .iter()
                    .enumerate()
                    .skip(offset)
                    .take(inner_height(editor))
                    .map(|(idx, line)| {
                        Line::from(vec![
                            Span::styled(format!("{:>4} ", idx + 1), dim_style),
                            Span::raw(line.clone()),
                        ])
                    })
                    .collect()
            }
        };
        let editor_style = if surface.is_editable() {
            Style::default()
        } else {
            dim_style
        };
        Paragraph::new(editor_lines)
            .style(editor_style)
            .block(editor_block)
            .render(editor, buf);

        // output
        let transcript = controller.transcript().lines();
        let skip = transcript.len().saturating_sub(inner_height(output));
        let output_lines: Vec<Line> = transcript
            .iter()
            .skip(skip)
            .map(|line| {
                let style = match line.kind {
                    OutputKind::Error => red_style,
                    OutputKind::Success => green_style,
                    OutputKind::Plain => Style::default(),
                };
                Line::from(Span::styled(line.text.clone(), style))
            })
            .collect();
        Paragraph::new(output_lines)
            .block(Block::default().borders(Borders::ALL).title(" Output "))
            .render(output, buf);

        // footer
        let notice = controller
            .last_notice()
            .map(|notice| {
                let style = match notice.level {
                    NoticeLevel::Info => Style::default().fg(Color::Cyan),
                    NoticeLevel::Success => green_style,
                    NoticeLevel::Error => red_style,
                };
                Span::styled(notice.text.clone(), style)
            })
            .unwrap_or_else(|| Span::raw(""));
        Paragraph::new(vec![
            Line::from(notice),
            Line::from(Span::styled(KEY_HINTS, dim_style)),
        ])
        .render(footer, buf);

        if controller.status() == &BackendStatus::Loading {
            render_loading_overlay(controller.language().label(), area, buf);
        }
    }
}

fn render_loading_overlay(label: &str, area: Rect, buf: &mut Buffer) {
    let width = 40u16.min(area.width);
    let height = 5u16.min(area.height);
    let popup = Rect {
        x: area.x + (area.width - width) / 2,
        y: area.y + (area.height - height) / 2,
        width,
        height,
    };
    Clear.render(popup, buf);
    Paragraph::new(format!("Loading the {label} runtime..."))
        .alignment(Alignment::Center)
        .wrap(Wrap { trim: true })
        .block(Block::default().borders(Borders::ALL))
        .style(
            Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD),
        )
        .render(popup, buf);
}
