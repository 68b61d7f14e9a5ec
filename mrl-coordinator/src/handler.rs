use std::io::{self, BufReader, Read, Write};

use common::codec::{read_message, write_message, Message, ProtocolError};
use tracing::{debug, info, warn};

use crate::work_queue::WorkQueue;

/// Service one worker connection: read a single message, act on it, and
/// reply where the protocol calls for a reply.
///
/// Nothing a worker sends can bring the master down; bad input is logged
/// and the connection dropped.
pub fn handle_request<S: Read + Write>(stream: S, peer: &str, queue: &WorkQueue) {
    debug!("Incoming communication from {}", peer);

    let mut reader = BufReader::new(stream);
    let message = match read_message(&mut reader) {
        Ok(message) => message,
        Err(ProtocolError::Unrecognized(kind)) => {
            warn!("Ignoring unrecognized message type of \"{}\" from {}", kind, peer);
            return;
        }
        Err(ProtocolError::Io(e))
            if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
        {
            info!("Worker at {} went silent, dropping the connection", peer);
            return;
        }
        Err(e) => {
            info!("Spurious connection received from {}: {}", peer, e);
            return;
        }
    };

    match message {
        Message::WorkerReady => assign_unit(reader.get_mut(), peer, queue),
        Message::JobSucceeded(unit) => {
            if queue.report_success(&unit) {
                info!("Unit \"{}\" fully processed by worker at {}", unit, peer);
            } else {
                warn!("Worker at {} reported success on unknown unit \"{}\"", peer, unit);
            }
        }
        Message::JobFailed(unit) => {
            if queue.report_failure(&unit) {
                info!(
                    "Unit \"{}\" not properly processed by worker at {}, so rescheduling",
                    unit, peer
                );
            } else {
                warn!("Worker at {} reported failure on unknown unit \"{}\"", peer, unit);
            }
        }
        Message::JobInfo(text) => info!("[{}] {}", peer, text),
        other => warn!("Ignoring unexpected message {} from {}", other, peer),
    }

    debug!("Conversation with {} complete", peer);
}

fn assign_unit<W: Write>(writer: &mut W, peer: &str, queue: &WorkQueue) {
    let Some(unit) = queue.next_unit() else {
        info!("Informing worker at {} that all units have been processed", peer);
        if let Err(e) = write_message(writer, &Message::ServerDone) {
            debug!("Worker at {} left before hearing we are done: {}", peer, e);
        }
        return;
    };

    info!("Instructing worker at {} to process \"{}\"", peer, unit);
    if let Err(e) = write_message(writer, &Message::JobStart(unit.clone())) {
        // The worker never heard about the unit, so nobody will report on it.
        warn!("Could not hand \"{}\" to worker at {}: {}", unit, peer, e);
        queue.report_failure(&unit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work_queue::QueueStatus;
    use std::io::Cursor;

    /// In-memory connection: reads from a fixed request, records the reply.
    struct FakeStream {
        request: Cursor<Vec<u8>>,
        reply: Vec<u8>,
        broken_pipe: bool,
        silent: bool,
    }

    impl FakeStream {
        fn new(request: &str) -> Self {
            Self {
                request: Cursor::new(request.as_bytes().to_vec()),
                reply: Vec::new(),
                broken_pipe: false,
                silent: false,
            }
        }
    }

    impl Read for FakeStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.silent {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            self.request.read(buf)
        }
    }

    impl Write for FakeStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.broken_pipe {
                return Err(io::ErrorKind::BrokenPipe.into());
            }
            self.reply.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn exchange(request: &str, queue: &WorkQueue) -> String {
        let mut stream = FakeStream::new(request);
        handle_request(&mut stream, "127.0.0.1", queue);
        String::from_utf8(stream.reply).unwrap()
    }

    #[test]
    fn ready_worker_gets_next_unit() {
        let queue = WorkQueue::new();
        queue.stage(vec!["/in/a.input".to_string()]);

        assert_eq!(exchange("WORKER_READY\n", &queue), "JOB_START /in/a.input\n");
        assert_eq!(
            queue.status(),
            QueueStatus {
                unscheduled: 0,
                in_flight: 1
            }
        );
    }

    #[test]
    fn ready_worker_is_told_to_exit_when_phase_is_done() {
        let queue = WorkQueue::new();
        assert_eq!(exchange("WORKER_READY\n", &queue), "SERVER_DONE\n");
    }

    #[test]
    fn reports_update_the_queue_without_reply() {
        let queue = WorkQueue::new();
        queue.stage(vec!["a".to_string(), "b".to_string()]);
        exchange("WORKER_READY\n", &queue);
        exchange("WORKER_READY\n", &queue);

        assert_eq!(exchange("JOB_FAILED a\n", &queue), "");
        assert_eq!(exchange("JOB_SUCCEEDED b\n", &queue), "");
        assert_eq!(
            queue.status(),
            QueueStatus {
                unscheduled: 1,
                in_flight: 0
            }
        );
        assert_eq!(exchange("WORKER_READY\n", &queue), "JOB_START a\n");
    }

    #[test]
    fn info_and_garbage_leave_the_queue_alone() {
        let queue = WorkQueue::new();
        queue.stage(vec!["a".to_string()]);

        for request in [
            "JOB_INFO About to process \"a\".\n",
            "HELLO there\n",
            "JOB_SUCCEEDED\n",
            "SERVER_DONE\n",
            "",
        ] {
            assert_eq!(exchange(request, &queue), "");
        }
        assert_eq!(
            queue.status(),
            QueueStatus {
                unscheduled: 1,
                in_flight: 0
            }
        );
    }

    #[test]
    fn unit_with_trailing_space_can_be_reported() {
        let queue = WorkQueue::new();
        queue.stage(vec!["/in/a ".to_string(), "/in/b".to_string()]);

        let reply = exchange("WORKER_READY\n", &queue);
        let Message::JobStart(unit) = Message::decode(&reply).unwrap() else {
            panic!("expected an assignment, got {reply:?}");
        };
        assert_eq!(unit, "/in/a ");

        exchange(&format!("JOB_FAILED {unit}\n"), &queue);
        assert_eq!(exchange("WORKER_READY\n", &queue), "JOB_START /in/b\n");
        assert_eq!(exchange("WORKER_READY\n", &queue), "JOB_START /in/a \n");

        exchange(&format!("JOB_SUCCEEDED {unit}\n"), &queue);
        exchange("JOB_SUCCEEDED /in/b\n", &queue);
        assert!(queue.is_complete());
    }

    #[test]
    fn silent_peer_times_out_without_touching_the_queue() {
        let queue = WorkQueue::new();
        queue.stage(vec!["a".to_string()]);

        let mut stream = FakeStream::new("");
        stream.silent = true;
        handle_request(&mut stream, "127.0.0.1", &queue);

        assert!(stream.reply.is_empty());
        assert_eq!(
            queue.status(),
            QueueStatus {
                unscheduled: 1,
                in_flight: 0
            }
        );
    }

    #[test]
    fn undeliverable_assignment_is_requeued() {
        let queue = WorkQueue::new();
        queue.stage(vec!["a".to_string()]);

        let mut stream = FakeStream::new("WORKER_READY\n");
        stream.broken_pipe = true;
        handle_request(&mut stream, "127.0.0.1", &queue);

        assert_eq!(
            queue.status(),
            QueueStatus {
                unscheduled: 1,
                in_flight: 0
            }
        );
    }
}
