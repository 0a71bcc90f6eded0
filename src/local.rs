//! Local client transport over the Unix socket.
//!
//! Every local process speaks the frame format from [`crate::ipc`]. On
//! connect the client receives a full registry push (`ServicesRegistered`
//! with every known identity); afterwards it sees deltas. Requests that
//! mutate the registry are answered with an `Answer` frame carrying the
//! request id; `SendMessage` and `SubscribeNotification` are not answered,
//! the reaction (if any) flows back as a regular frame.

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::connection::{FlushOutcome, StreamConnection};
use crate::dispatcher::{Action, Dispatcher};
use crate::ipc::{
    self, IpcFrameProgress, IpcFrameReader, IpcKind, IpcMessage, IpcReturnCode,
};
use crate::net::StreamSocket;
use crate::runtime::Command;
use crate::{ClientIdentifier, MemberIdentity};

// ============================================================================
// FRAME HANDLING
// ============================================================================

/// Handle one frame from a local client against the dispatcher. Returns
/// the answer frame to send back, if the kind warrants one.
pub fn handle_ipc_message(
    frame: &IpcMessage,
    client: ClientIdentifier,
    dispatcher: &mut Dispatcher,
    actions: &mut Vec<Action>,
) -> Option<IpcMessage> {
    match frame.kind {
        IpcKind::Pong => {
            tracing::trace!(client, "pong");
            None
        }
        IpcKind::SendMessage => {
            // Replies carry their reply target in the body's out-of-band
            // identifier field, echoed by the client; decode sets it
            match ipc::decode_message_body(&frame.body) {
                Some(message) => dispatcher.dispatch_message(message, client, actions),
                None => tracing::warn!(client, "malformed SendMessage body"),
            }
            None
        }
        IpcKind::RegisterService => {
            let Some(identity) = ipc::get_identity(&mut frame.body.as_ref()) else {
                tracing::warn!(client, "malformed RegisterService body");
                return Some(IpcMessage::answer_to(frame, IpcReturnCode::Error, Bytes::new()));
            };
            let ok = dispatcher.try_register_service(identity, client, true, actions);
            let code = if ok { IpcReturnCode::Ok } else { IpcReturnCode::Error };
            Some(IpcMessage::answer_to(frame, code, Bytes::new()))
        }
        IpcKind::UnregisterService => {
            let Some(identity) = ipc::get_identity(&mut frame.body.as_ref()) else {
                tracing::warn!(client, "malformed UnregisterService body");
                return Some(IpcMessage::answer_to(frame, IpcReturnCode::Error, Bytes::new()));
            };
            // Only the owner may unregister
            let owned = dispatcher
                .client(client)
                .map(|record| record.owns_service(identity))
                .unwrap_or(false);
            if owned {
                dispatcher.unregister_service(identity, actions);
                Some(IpcMessage::answer_to(frame, IpcReturnCode::Ok, Bytes::new()))
            } else {
                tracing::warn!(client, %identity, "unregister refused, not the owner");
                Some(IpcMessage::answer_to(frame, IpcReturnCode::Error, Bytes::new()))
            }
        }
        IpcKind::SubscribeNotification => {
            match ipc::decode_subscription_body(&frame.body) {
                Some((identity, member_id)) => {
                    let member = MemberIdentity::new(identity, member_id);
                    dispatcher.subscribe_notification(client, member, actions);
                }
                None => tracing::warn!(client, "malformed SubscribeNotification body"),
            }
            None
        }
        IpcKind::GetServiceList => Some(IpcMessage::answer_to(
            frame,
            IpcReturnCode::Ok,
            ipc::encode_identity_list(&dispatcher.service_list()),
        )),
        IpcKind::DumpState => Some(IpcMessage::answer_to(
            frame,
            IpcReturnCode::Ok,
            Bytes::from(dispatcher.dump_state().into_bytes()),
        )),
        IpcKind::Ping
        | IpcKind::Answer
        | IpcKind::ServicesRegistered
        | IpcKind::ServicesUnregistered => {
            tracing::warn!(client, kind = ?frame.kind, "unexpected frame from client");
            None
        }
    }
}

/// The initial registry push a freshly connected client receives.
pub fn registry_push(dispatcher: &Dispatcher) -> Bytes {
    IpcMessage::new(
        IpcKind::ServicesRegistered,
        ipc::encode_identity_list(&dispatcher.service_list()),
    )
    .encode()
}

/// A liveness probe frame.
pub fn ping_frame() -> Bytes {
    IpcMessage::new(IpcKind::Ping, Bytes::new()).encode()
}

// ============================================================================
// CONNECTION TASK
// ============================================================================

/// Drives one local client connection: inbound frames become
/// [`Command::IpcFrame`], outbound frames arrive over the channel, and
/// congestion suspends ingress like on the TCP side.
pub async fn local_client_task<T: StreamSocket>(
    stream: T,
    client: ClientIdentifier,
    outbound: mpsc::UnboundedReceiver<Bytes>,
    commands: mpsc::UnboundedSender<Command>,
) {
    if let Err(e) = run_local_client(stream, client, outbound, &commands).await {
        tracing::warn!(client, error = %e, "local client connection failed");
    }
    let _ = commands.send(Command::Disconnected { client });
}

async fn run_local_client<T: StreamSocket>(
    stream: T,
    client: ClientIdentifier,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    commands: &mpsc::UnboundedSender<Command>,
) -> crate::Result<()> {
    let mut conn = StreamConnection::new(stream);
    let mut frames = IpcFrameReader::new();

    loop {
        if conn.is_congested() {
            tokio::select! {
                ready = conn.writable() => {
                    ready?;
                    if conn.write_pending()? == FlushOutcome::CongestionFinished {
                        tracing::debug!(client, "local connection congestion over");
                    }
                }
                maybe = outbound.recv() => match maybe {
                    Some(bytes) => { conn.write_non_blocking(&bytes)?; }
                    None => return Ok(()),
                },
            }
        } else {
            tokio::select! {
                ready = conn.readable() => {
                    ready?;
                    loop {
                        match frames.read(conn.stream())? {
                            IpcFrameProgress::Frame(message) => {
                                if commands
                                    .send(Command::IpcFrame { client, message })
                                    .is_err()
                                {
                                    return Ok(());
                                }
                            }
                            IpcFrameProgress::NeedMore => break,
                            IpcFrameProgress::Closed => return Ok(()),
                        }
                    }
                }
                maybe = outbound.recv() => match maybe {
                    Some(bytes) => { conn.write_non_blocking(&bytes)?; }
                    None => return Ok(()),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::ClientKind;
    use crate::ipc::decode_identity_list;
    use crate::wire::{Header, MessageType};
    use crate::ServiceIdentity;

    fn frame(kind: IpcKind, request_id: u16, body: Bytes) -> IpcMessage {
        let mut frame = IpcMessage::new(kind, body);
        frame.request_id = request_id;
        frame
    }

    #[test]
    fn register_answers_ok_and_is_visible_in_service_list() {
        let mut d = Dispatcher::new();
        let client = d.on_new_client(ClientKind::Local);
        let identity = ServiceIdentity::new(0x1234, 1);

        let mut actions = Vec::new();
        let request = frame(
            IpcKind::RegisterService,
            3,
            ipc::encode_identity_body(identity),
        );
        let answer = handle_ipc_message(&request, client, &mut d, &mut actions).unwrap();
        assert_eq!(answer.kind, IpcKind::Answer);
        assert_eq!(answer.request_id, 3);
        assert_eq!(answer.return_code, IpcReturnCode::Ok);

        let list = frame(IpcKind::GetServiceList, 4, Bytes::new());
        let answer = handle_ipc_message(&list, client, &mut d, &mut actions).unwrap();
        assert_eq!(decode_identity_list(&answer.body), vec![identity]);
    }

    #[test]
    fn duplicate_register_answers_error() {
        let mut d = Dispatcher::new();
        let a = d.on_new_client(ClientKind::Local);
        let b = d.on_new_client(ClientKind::Local);
        let body = ipc::encode_identity_body(ServiceIdentity::new(0x1234, 1));

        let mut actions = Vec::new();
        let first = handle_ipc_message(
            &frame(IpcKind::RegisterService, 1, body.clone()),
            a,
            &mut d,
            &mut actions,
        )
        .unwrap();
        assert_eq!(first.return_code, IpcReturnCode::Ok);

        let second = handle_ipc_message(
            &frame(IpcKind::RegisterService, 2, body),
            b,
            &mut d,
            &mut actions,
        )
        .unwrap();
        assert_eq!(second.return_code, IpcReturnCode::Error);
    }

    #[test]
    fn unregister_refused_for_non_owner() {
        let mut d = Dispatcher::new();
        let owner = d.on_new_client(ClientKind::Local);
        let intruder = d.on_new_client(ClientKind::Local);
        let identity = ServiceIdentity::new(0x1234, 1);
        let body = ipc::encode_identity_body(identity);

        let mut actions = Vec::new();
        handle_ipc_message(
            &frame(IpcKind::RegisterService, 1, body.clone()),
            owner,
            &mut d,
            &mut actions,
        );

        let refused = handle_ipc_message(
            &frame(IpcKind::UnregisterService, 2, body.clone()),
            intruder,
            &mut d,
            &mut actions,
        )
        .unwrap();
        assert_eq!(refused.return_code, IpcReturnCode::Error);
        assert!(d.service(identity).is_some());

        let granted = handle_ipc_message(
            &frame(IpcKind::UnregisterService, 3, body),
            owner,
            &mut d,
            &mut actions,
        )
        .unwrap();
        assert_eq!(granted.return_code, IpcReturnCode::Ok);
        assert!(d.service(identity).is_none());
    }

    #[test]
    fn request_flows_to_provider_and_response_back() {
        let mut d = Dispatcher::new();
        let provider = d.on_new_client(ClientKind::Local);
        let requester = d.on_new_client(ClientKind::Local);
        let identity = ServiceIdentity::new(0x1234, 1);

        let mut actions = Vec::new();
        handle_ipc_message(
            &frame(
                IpcKind::RegisterService,
                1,
                ipc::encode_identity_body(identity),
            ),
            provider,
            &mut d,
            &mut actions,
        );

        // Requester sends a request
        let mut request = crate::wire::Message::new(
            Header::new(0x1234, 0x0001, 0x0042, MessageType::Request, 0),
            Bytes::new(),
        );
        request.instance_id = 1;
        let mut actions = Vec::new();
        handle_ipc_message(
            &frame(IpcKind::SendMessage, 2, ipc::encode_message_body(&request)),
            requester,
            &mut d,
            &mut actions,
        );
        let delivered = match &actions[0] {
            Action::Deliver { target, message } => {
                assert_eq!(*target, provider);
                message.clone()
            }
            other => panic!("expected delivery, got {other:?}"),
        };
        assert_eq!(delivered.client_identifier, Some(requester));
        // The RequestID crossed the socket untouched
        assert_eq!(delivered.header.request_id, 0x0042);

        // Provider answers, mirroring the RequestID and echoing the
        // out-of-band identifier it received
        let mut response = crate::wire::Message::new(
            Header::new(
                0x1234,
                0x0001,
                delivered.header.request_id,
                MessageType::Response,
                0,
            ),
            Bytes::new(),
        );
        response.instance_id = 1;
        response.client_identifier = delivered.client_identifier;
        let mut actions = Vec::new();
        handle_ipc_message(
            &frame(IpcKind::SendMessage, 3, ipc::encode_message_body(&response)),
            provider,
            &mut d,
            &mut actions,
        );
        match &actions[0] {
            Action::Deliver { target, message } => {
                assert_eq!(*target, requester);
                assert_eq!(message.header.message_type, MessageType::Response);
                assert_eq!(message.header.request_id, 0x0042);
            }
            other => panic!("expected delivery, got {other:?}"),
        }
    }

    #[test]
    fn subscribe_has_no_answer_but_takes_effect() {
        let mut d = Dispatcher::new();
        let publisher = d.on_new_client(ClientKind::Local);
        let subscriber = d.on_new_client(ClientKind::Local);

        let mut actions = Vec::new();
        let answer = handle_ipc_message(
            &frame(
                IpcKind::SubscribeNotification,
                1,
                ipc::encode_subscription_body(ServiceIdentity::new(0x1234, 0), 0x8001),
            ),
            subscriber,
            &mut d,
            &mut actions,
        );
        assert!(answer.is_none());

        let notification = crate::wire::Message::new(
            Header::new(0x1234, 0x8001, 0, MessageType::Notification, 0),
            Bytes::new(),
        );
        let mut actions = Vec::new();
        d.dispatch_message(notification, publisher, &mut actions);
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::Deliver { target, .. } if *target == subscriber)));
    }

    #[test]
    fn registry_push_lists_current_services() {
        let mut d = Dispatcher::new();
        let client = d.on_new_client(ClientKind::Local);
        let mut actions = Vec::new();
        d.register_service(ServiceIdentity::new(0x1234, 1), client, true, &mut actions);

        let push = registry_push(&d);
        let decoded =
            IpcMessage::decode_body(&push[ipc::LENGTH_PREFIX_SIZE..]).unwrap();
        assert_eq!(decoded.kind, IpcKind::ServicesRegistered);
        assert_eq!(
            decode_identity_list(&decoded.body),
            vec![ServiceIdentity::new(0x1234, 1)]
        );
    }

    #[test]
    fn dump_state_answer_is_text() {
        let mut d = Dispatcher::new();
        let client = d.on_new_client(ClientKind::Local);
        let mut actions = Vec::new();
        let answer = handle_ipc_message(
            &frame(IpcKind::DumpState, 9, Bytes::new()),
            client,
            &mut d,
            &mut actions,
        )
        .unwrap();
        assert!(String::from_utf8(answer.body.to_vec())
            .unwrap()
            .contains("Services:"));
    }
}
