use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers, MouseButton, MouseEvent, MouseEventKind};
use log::{info, warn};
use ratatui::layout::Rect;

use crate::event::Event;
use crate::foreground::{ForegroundAgent, ForegroundError, SendOutcome, WidgetPhase};
use crate::store::Position;
use crate::ui;

/// Host state around the foreground agent: the text being typed and what the
/// last frame looked like.
pub struct App {
    pub running: bool,
    pub agent: ForegroundAgent,
    pub input: String,
    pub status_message: String,
    /// Where the widget was drawn last frame, for header hit-testing.
    pub widget_area: Option<Rect>,
}

impl App {
    pub fn new(agent: ForegroundAgent) -> Self {
        Self {
            running: true,
            agent,
            input: String::new(),
            status_message: String::new(),
            widget_area: None,
        }
    }

    pub async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Tick | Event::Resize(..) => {}
            Event::Key(key) => self.handle_key(key).await,
            Event::Mouse(mouse) => self.handle_mouse(mouse).await,
        }
    }

    fn report(&mut self, result: Result<(), ForegroundError>) {
        if let Err(err) = result {
            warn!("{}", err);
            self.status_message = err.to_string();
        }
    }

    pub async fn handle_key(&mut self, key: KeyEvent) {
        if key.kind != KeyEventKind::Press {
            return;
        }
        if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('q') {
            self.agent.conversations().cancel_all();
            self.running = false;
            return;
        }

        let phase = self.agent.widget().phase();
        let result = match key.code {
            KeyCode::F(2) if phase.is_visible() => self.agent.hide().await,
            KeyCode::F(2) => self.agent.show().await,
            KeyCode::F(3) => self.agent.toggle_minimize().await,
            KeyCode::F(5) => self.agent.refresh_directory().await,
            // The rest only applies to the expanded widget.
            _ if phase != WidgetPhase::Expanded => Ok(()),
            KeyCode::Esc => self.agent.hide().await,
            KeyCode::Tab => self.agent.cycle_organization(1).await,
            KeyCode::BackTab => self.agent.cycle_agent(1).await,
            KeyCode::Enter => {
                self.submit();
                Ok(())
            }
            KeyCode::Backspace => {
                self.input.pop();
                Ok(())
            }
            KeyCode::Char(ch) => {
                self.input.push(ch);
                Ok(())
            }
            _ => Ok(()),
        };
        self.report(result);
    }

    /// Claims the conversation before clearing the input, then runs the send
    /// on its own task so the UI keeps drawing while the reply streams in.
    fn submit(&mut self) {
        if self.input.trim().is_empty() {
            return;
        }
        let Some(message) = self.agent.compose(self.input.clone()) else {
            self.status_message = String::from("Select an organization and an agent first");
            return;
        };
        let pending = match self.agent.conversations().start_send(message) {
            Ok(pending) => pending,
            Err(SendOutcome::Busy) => {
                self.status_message = String::from("Still waiting for the previous reply");
                return;
            }
            Err(_) => return,
        };
        self.input.clear();
        self.status_message.clear();
        tokio::spawn(async move {
            let key = pending.key().clone();
            match pending.run().await {
                SendOutcome::Completed => {
                    info!("Reply complete for {} / {}", key.organization_id, key.agent_id)
                }
                outcome => warn!(
                    "Message to {} / {} ended as {:?}",
                    key.organization_id, key.agent_id, outcome
                ),
            }
        });
    }

    pub async fn handle_mouse(&mut self, event: MouseEvent) {
        let pointer = Position::new(event.column, event.row);
        match event.kind {
            MouseEventKind::Down(MouseButton::Left) => {
                if let Some(area) = self.widget_area
                    && ui::is_header_hit(area, event.column, event.row)
                {
                    self.agent
                        .widget_mut()
                        .begin_drag(Position::new(area.x, area.y), pointer);
                }
            }
            MouseEventKind::Drag(MouseButton::Left) => self.agent.widget_mut().drag_to(pointer),
            MouseEventKind::Up(MouseButton::Left) => {
                let result = self.agent.widget_mut().end_drag().await;
                self.report(result.map_err(ForegroundError::from));
            }
            _ => {}
        }
    }
}
