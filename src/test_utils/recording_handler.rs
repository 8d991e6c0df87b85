use parking_lot::Mutex;

use super::TestSecret;
use crate::EventHandler;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    Add(TestSecret),
    Update(TestSecret, TestSecret),
    Delete(TestSecret),
}

/// Handler that keeps every callback it receives, in order.
#[derive(Debug, Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<Recorded>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Recorded> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn adds(&self) -> usize {
        self.count(|e| matches!(e, Recorded::Add(_)))
    }

    pub fn updates(&self) -> usize {
        self.count(|e| matches!(e, Recorded::Update(_, _)))
    }

    pub fn deletes(&self) -> usize {
        self.count(|e| matches!(e, Recorded::Delete(_)))
    }

    fn count(
        &self,
        f: impl Fn(&Recorded) -> bool,
    ) -> usize {
        self.events.lock().iter().filter(|e| f(e)).count()
    }
}

impl EventHandler<TestSecret> for RecordingHandler {
    fn on_add(
        &self,
        obj: &TestSecret,
    ) {
        self.events.lock().push(Recorded::Add(obj.clone()));
    }

    fn on_update(
        &self,
        old: &TestSecret,
        new: &TestSecret,
    ) {
        self.events.lock().push(Recorded::Update(old.clone(), new.clone()));
    }

    fn on_delete(
        &self,
        obj: &TestSecret,
    ) {
        self.events.lock().push(Recorded::Delete(obj.clone()));
    }
}
