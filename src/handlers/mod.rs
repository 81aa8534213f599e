use crate::protocol::{EventFrame, ValueFrame};
use serde::Serialize;

pub type EventHandler = Box<dyn FnMut(EventFrame) + Send>;
pub type ValueHandler = Box<dyn FnMut(ValueFrame) + Send>;
pub type TextHandler = Box<dyn FnMut(&str) + Send>;

/// Callbacks for inbound frames, invoked in registration order.
#[derive(Default)]
pub struct HandlerRegistry {
    event: Vec<EventHandler>,
    value: Vec<ValueHandler>,
    text: Vec<TextHandler>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct HandlerCounts {
    pub event: usize,
    pub value: usize,
    pub text: usize,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_event<F>(&mut self, handler: F)
    where
        F: FnMut(EventFrame) + Send + 'static,
    {
        self.event.push(Box::new(handler));
    }

    pub fn on_value<F>(&mut self, handler: F)
    where
        F: FnMut(ValueFrame) + Send + 'static,
    {
        self.value.push(Box::new(handler));
    }

    pub fn on_text<F>(&mut self, handler: F)
    where
        F: FnMut(&str) + Send + 'static,
    {
        self.text.push(Box::new(handler));
    }

    pub fn dispatch_event(&mut self, frame: EventFrame) {
        for handler in self.event.iter_mut() {
            handler(frame);
        }
    }

    pub fn dispatch_value(&mut self, frame: ValueFrame) {
        for handler in self.value.iter_mut() {
            handler(frame);
        }
    }

    pub fn dispatch_text(&mut self, payload: &str) {
        for handler in self.text.iter_mut() {
            handler(payload);
        }
    }

    pub fn counts(&self) -> HandlerCounts {
        HandlerCounts {
            event: self.event.len(),
            value: self.value.len(),
            text: self.text.len(),
        }
    }
}
