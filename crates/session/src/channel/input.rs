//! Input event construction
//!
//! Fire-and-forget pointer and key events. No acknowledgment exists at this
//! layer; in-order delivery on the control channel is all the ordering input
//! needs.

use deskbridge_core::control::{ControlMessage, MouseAction, MouseButton};

/// Pointer moved to absolute coordinates
pub fn mouse_move(x: i32, y: i32, monitor: Option<usize>) -> ControlMessage {
    ControlMessage::Mouse {
        action: MouseAction::Move,
        x: Some(x),
        y: Some(y),
        delta_x: None,
        delta_y: None,
        button: None,
        monitor,
    }
}

/// Button pressed at the pointer's current position
pub fn mouse_down(button: MouseButton) -> ControlMessage {
    ControlMessage::Mouse {
        action: MouseAction::Down,
        x: None,
        y: None,
        delta_x: None,
        delta_y: None,
        button: Some(button),
        monitor: None,
    }
}

/// Button released
pub fn mouse_up(button: MouseButton) -> ControlMessage {
    ControlMessage::Mouse {
        action: MouseAction::Up,
        x: None,
        y: None,
        delta_x: None,
        delta_y: None,
        button: Some(button),
        monitor: None,
    }
}

/// Wheel scrolled by deltas
pub fn mouse_scroll(delta_x: f32, delta_y: f32) -> ControlMessage {
    ControlMessage::Mouse {
        action: MouseAction::Scroll,
        x: None,
        y: None,
        delta_x: Some(delta_x),
        delta_y: Some(delta_y),
        button: None,
        monitor: None,
    }
}

/// Key pressed
pub fn key_press(key_code: u32, modifiers: &[&str]) -> ControlMessage {
    ControlMessage::Keyboard {
        key_code,
        modifiers: modifiers.iter().map(|m| m.to_string()).collect(),
        pressed: true,
    }
}

/// Key released
pub fn key_release(key_code: u32) -> ControlMessage {
    ControlMessage::Keyboard {
        key_code,
        modifiers: Vec::new(),
        pressed: false,
    }
}
