use crossterm::event::{KeyEvent, MouseEvent};

/// Events the host loop feeds into the [`App`](crate::app::App).
#[derive(Debug)]
pub enum Event {
    /// Redraw interval elapsed; streamed fragments show up on the next frame.
    Tick,
    Key(KeyEvent),
    Mouse(MouseEvent),
    Resize(u16, u16),
}
