//! The request queue and archive.
//!
//! Received requests wait in the queue until processed; finished requests
//! move to the archive with their event log attached. A request id lives in
//! exactly one of the two at any time.

use std::collections::VecDeque;

use crate::error::ServerError;
use crate::message::Message;

#[derive(Default)]
pub struct RequestQueue {
    pending: VecDeque<Message>,
    archive: Vec<Message>,
    last_id: u32,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hands out the next request id. Ids are strictly increasing, start at
    /// 1 and are never reused.
    pub fn assign_id(&mut self) -> u32 {
        self.last_id += 1;
        self.last_id
    }

    /// Appends a request to the queue, assigning its id.
    pub fn enqueue(&mut self, mut message: Message) -> u32 {
        let id: u32 = self.assign_id();
        message.id = id;
        self.pending.push_back(message);
        id
    }

    /// Pops the oldest pending request.
    pub fn pop_next(&mut self) -> Option<Message> {
        self.pending.pop_front()
    }

    /// Removes a specific pending request for explicit processing.
    pub fn take_by_id(&mut self, id: u32) -> Result<Message, ServerError> {
        if let Some(position) = self.pending.iter().position(|m| m.id == id) {
            return Ok(self.pending.remove(position).expect("position just found"));
        }
        if self.archive.iter().any(|m| m.id == id) {
            return Err(ServerError::AlreadyProcessed(id));
        }

        Err(ServerError::UnknownRequestId(id))
    }

    /// Moves a processed request to the archive.
    pub fn archive(&mut self, message: Message) {
        debug_assert!(self.pending.iter().all(|m| m.id != message.id));
        self.archive.push(message);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_ids(&self) -> Vec<u32> {
        self.pending.iter().map(|m| m.id).collect()
    }

    pub fn archived(&self) -> &[Message] {
        &self.archive
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_text, MessageType};
    use std::net::SocketAddr;

    fn text_message() -> Message {
        let addr: SocketAddr = "127.0.0.1:5001".parse().unwrap();
        Message::new(
            MessageType::TextMessage,
            encode_text("127.0.0.1", 5001, "hi"),
            addr,
        )
    }

    #[test]
    fn test_ids_are_strictly_increasing_from_one() {
        let mut queue = RequestQueue::new();

        let first: u32 = queue.enqueue(text_message());
        let second: u32 = queue.enqueue(text_message());
        let direct: u32 = queue.assign_id();

        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert_eq!(direct, 3);
    }

    #[test]
    fn test_message_lives_in_exactly_one_place() {
        let mut queue = RequestQueue::new();
        let id: u32 = queue.enqueue(text_message());

        let message: Message = queue.take_by_id(id).unwrap();
        assert_eq!(queue.pending_count(), 0);

        queue.archive(message);
        assert_eq!(queue.archived().len(), 1);
        assert!(queue.pending_ids().is_empty());
    }

    #[test]
    fn test_take_by_id_refuses_archived_and_unknown_ids() {
        let mut queue = RequestQueue::new();
        let id: u32 = queue.enqueue(text_message());
        let message: Message = queue.take_by_id(id).unwrap();
        queue.archive(message);

        match queue.take_by_id(id) {
            Err(ServerError::AlreadyProcessed(1)) => {}
            other => panic!("expected AlreadyProcessed, got {:?}", other),
        }
        match queue.take_by_id(99) {
            Err(ServerError::UnknownRequestId(99)) => {}
            other => panic!("expected UnknownRequestId, got {:?}", other),
        }
    }

    #[test]
    fn test_pop_next_is_fifo() {
        let mut queue = RequestQueue::new();
        queue.enqueue(text_message());
        queue.enqueue(text_message());

        assert_eq!(queue.pop_next().unwrap().id, 1);
        assert_eq!(queue.pop_next().unwrap().id, 2);
        assert!(queue.pop_next().is_none());
    }
}
