//! IMAP Server
//!
//! One task per connection; commands on a connection are handled strictly
//! in order. The command loop is generic over the stream so a connection
//! can continue over TLS after STARTTLS, and so tests can drive it over an
//! in-memory pipe.

use super::backend::ImapBackend;
use super::command::{FetchItem, ImapCommand, StoreFlags, TaggedCommand};
use super::error::MailboxError;
use super::mailbox::{FetchedMessage, Flag, Mailbox};
use super::parser::ImapParser;
use super::response::{ImapResponse, DELIMITER};
use super::search::SearchPredicate;
use super::session::{ImapSession, SelectedMailbox, SessionState};
use super::uid::{AddressingMode, SequenceSet};
use crate::sasl::{self, SaslError};
use anyhow::Result;
use mailgate_common::config::ImapConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Semaphore};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Messages buffered between the store reader and the socket writer
const FETCH_CHANNEL_CAPACITY: usize = 32;

/// Flags clients may change
const PERMANENT_FLAGS: [Flag; 2] = [Flag::Seen, Flag::Deleted];

/// Longest AUTHENTICATE continuation line accepted, in bytes
const MAX_AUTH_LINE: u64 = 12 * 1024;

/// Idle BYE text
const AUTOLOGOUT: &str = "Autologout; idle for too long";

/// How a command loop ended
enum SessionEnd<S> {
    Closed,
    /// STARTTLS accepted; the raw stream is handed back for the handshake
    StartTls(S),
}

/// IMAP Server
pub struct ImapServer {
    config: ImapConfig,
    hostname: String,
    backend: Arc<ImapBackend>,
    tls_acceptor: Option<TlsAcceptor>,
    connection_semaphore: Arc<Semaphore>,
}

impl ImapServer {
    /// Create a new IMAP server
    pub fn new(
        config: ImapConfig,
        hostname: String,
        backend: Arc<ImapBackend>,
        tls_acceptor: Option<TlsAcceptor>,
    ) -> Self {
        let connection_semaphore = Arc::new(Semaphore::new(config.max_connections));
        Self {
            config,
            hostname,
            backend,
            tls_acceptor,
            connection_semaphore,
        }
    }

    /// Start the IMAP server
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(&self.config.bind).await?;
        info!(
            bind = %self.config.bind,
            starttls = self.tls_acceptor.is_some(),
            "IMAP server listening"
        );

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let permit = match self.connection_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            warn!(peer = %peer, "IMAP: Max connections reached, rejecting");
                            continue;
                        }
                    };

                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream, peer).await {
                            error!(peer = %peer, error = %e, "IMAP connection error");
                        }
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(error = %e, "IMAP: Failed to accept connection");
                }
            }
        }
    }

    /// Handle a single IMAP connection
    pub async fn handle_connection<S>(&self, mut stream: S, peer: SocketAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        info!(peer = %peer, "New IMAP connection");
        let mut session = ImapSession::new();

        let greeting = ImapResponse::greeting(&self.hostname, &self.capabilities(&session));
        stream.write_all(greeting.as_bytes()).await?;
        stream.flush().await?;

        if let SessionEnd::StartTls(stream) = self.serve(stream, &mut session, peer).await? {
            if let Some(acceptor) = &self.tls_acceptor {
                let tls_stream = acceptor.accept(stream).await?;
                session.tls_active = true;
                debug!(peer = %peer, "IMAP connection upgraded to TLS");
                self.serve(tls_stream, &mut session, peer).await?;
            }
        }

        info!(peer = %peer, session = %session.id, "IMAP connection closed");
        Ok(())
    }

    fn login_disabled(&self, session: &ImapSession) -> bool {
        self.tls_acceptor.is_some() && !session.tls_active && !self.config.allow_insecure_auth
    }

    fn capabilities(&self, session: &ImapSession) -> String {
        let starttls = self.tls_acceptor.is_some() && !session.tls_active;
        ImapResponse::capabilities(starttls, self.login_disabled(session))
    }

    /// Command loop over one stream
    async fn serve<S>(
        &self,
        stream: S,
        session: &mut ImapSession,
        peer: SocketAddr,
    ) -> Result<SessionEnd<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut stream = BufReader::new(stream);
        let idle_timeout = Duration::from_secs(self.config.timeout_minutes.saturating_mul(60));
        let mut line = String::new();

        loop {
            line.clear();

            match tokio::time::timeout(idle_timeout, stream.read_line(&mut line)).await {
                Ok(Ok(0)) => {
                    debug!(peer = %peer, "Connection closed by client");
                    return Ok(SessionEnd::Closed);
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    warn!(peer = %peer, "IMAP session idle timeout");
                    send(&mut stream, &ImapResponse::bye(AUTOLOGOUT)).await?;
                    stream.flush().await?;
                    return Ok(SessionEnd::Closed);
                }
            }

            session.update_activity();
            debug!(peer = %peer, command = %command_summary(&line), "IMAP command");

            let Some(TaggedCommand { tag, command }) = ImapParser::parse(&line) else {
                let tag = ImapParser::tag_of(&line).unwrap_or("*");
                send(&mut stream, &ImapResponse::bad(tag, "Invalid command or arguments")).await?;
                stream.flush().await?;
                continue;
            };

            match command {
                ImapCommand::StartTls => {
                    if session.tls_active {
                        send(&mut stream, &ImapResponse::bad(&tag, "TLS already active")).await?;
                    } else if self.tls_acceptor.is_none() {
                        send(&mut stream, &ImapResponse::no(&tag, "STARTTLS not available")).await?;
                    } else {
                        send(&mut stream, &ImapResponse::ok(&tag, "Begin TLS negotiation now"))
                            .await?;
                        stream.flush().await?;
                        return Ok(SessionEnd::StartTls(stream.into_inner()));
                    }
                }
                ImapCommand::Authenticate {
                    mechanism,
                    initial_response,
                } => {
                    let open = self
                        .handle_authenticate(&tag, &mechanism, initial_response, session, &mut stream)
                        .await?;
                    if !open {
                        stream.flush().await?;
                        return Ok(SessionEnd::Closed);
                    }
                }
                command => self.handle_command(&tag, command, session, &mut stream).await?,
            }
            stream.flush().await?;

            if session.state == SessionState::Logout {
                return Ok(SessionEnd::Closed);
            }
        }
    }

    /// Handle a parsed IMAP command, writing every response to `out`
    async fn handle_command<W>(
        &self,
        tag: &str,
        command: ImapCommand,
        session: &mut ImapSession,
        out: &mut W,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        match command {
            // Any state commands
            ImapCommand::Capability => {
                send(out, &ImapResponse::capability(&self.capabilities(session))).await?;
                send(out, &ImapResponse::ok(tag, "CAPABILITY completed")).await
            }
            ImapCommand::Noop => {
                if let Err(e) = self.refresh(session, out).await? {
                    warn!(session = %session.id, error = %e, "Mailbox refresh failed");
                }
                send(out, &ImapResponse::ok(tag, "NOOP completed")).await
            }
            ImapCommand::Logout => {
                session.logout();
                send(out, &ImapResponse::bye("Logging out")).await?;
                send(out, &ImapResponse::ok(tag, "LOGOUT completed")).await
            }

            // Authentication
            ImapCommand::Login { username, password } => {
                let response = if session.is_authenticated() {
                    ImapResponse::bad(tag, "Already authenticated")
                } else if self.login_disabled(session) {
                    ImapResponse::no_with_code(tag, "PRIVACYREQUIRED", "LOGIN disabled, use STARTTLS")
                } else {
                    self.complete_login(tag, &username, &password, "LOGIN", session)
                        .await
                };
                send(out, &response).await
            }

            // Authenticated state commands
            ImapCommand::Select { mailbox } => self.handle_select(tag, &mailbox, false, session, out).await,
            ImapCommand::Examine { mailbox } => self.handle_select(tag, &mailbox, true, session, out).await,
            ImapCommand::List { reference, pattern } => {
                self.handle_list(tag, &reference, &pattern, false, session, out)
                    .await
            }
            ImapCommand::Lsub { reference, pattern } => {
                // Every mailbox counts as subscribed
                self.handle_list(tag, &reference, &pattern, true, session, out)
                    .await
            }
            ImapCommand::Status { mailbox, items } => {
                self.handle_status(tag, &mailbox, &items, session, out).await
            }
            ImapCommand::Namespace => {
                if !session.is_authenticated() {
                    return send(out, &ImapResponse::no(tag, "Not authenticated")).await;
                }
                send(out, &ImapResponse::namespace()).await?;
                send(out, &ImapResponse::ok(tag, "NAMESPACE completed")).await
            }
            ImapCommand::Create { mailbox } => {
                let result = self.backend.create_mailbox(&mailbox).await;
                self.reply_unsupported(tag, session, result, out).await
            }
            ImapCommand::Delete { mailbox } => {
                let result = self.backend.delete_mailbox(&mailbox).await;
                self.reply_unsupported(tag, session, result, out).await
            }
            ImapCommand::Rename {
                old_mailbox,
                new_mailbox,
            } => {
                let result = self.backend.rename_mailbox(&old_mailbox, &new_mailbox).await;
                self.reply_unsupported(tag, session, result, out).await
            }
            ImapCommand::Subscribe { mailbox } => {
                let result = self.backend.subscribe(&mailbox).await;
                self.reply_unsupported(tag, session, result, out).await
            }
            ImapCommand::Unsubscribe { mailbox } => {
                let result = self.backend.unsubscribe(&mailbox).await;
                self.reply_unsupported(tag, session, result, out).await
            }
            ImapCommand::Append { mailbox } => self.handle_append(tag, &mailbox, session, out).await,

            // Selected state commands
            ImapCommand::Close => self.handle_close(tag, session, out).await,
            ImapCommand::Check => {
                if !session.is_selected() {
                    return send(out, &ImapResponse::no(tag, "No mailbox selected")).await;
                }
                match self.refresh(session, out).await? {
                    Ok(()) => send(out, &ImapResponse::ok(tag, "CHECK completed")).await,
                    Err(e) => send(out, &ImapResponse::error(tag, &e)).await,
                }
            }
            ImapCommand::Fetch {
                sequence,
                items,
                uid,
            } => self.handle_fetch(tag, &sequence, items, uid, session, out).await,
            ImapCommand::Search { predicate, uid } => {
                self.handle_search(tag, &predicate, uid, session, out).await
            }
            ImapCommand::Store {
                sequence,
                flags,
                uid,
            } => self.handle_store(tag, &sequence, &flags, uid, session, out).await,
            ImapCommand::Copy { mailbox, .. } => {
                let Some(selected) = selected_mailbox(session) else {
                    return send(out, &ImapResponse::no(tag, "No mailbox selected")).await;
                };
                let result = selected.copy_messages(&mailbox).await;
                self.reply_unsupported(tag, session, result, out).await
            }
            ImapCommand::Move { mailbox, .. } => {
                let Some(selected) = selected_mailbox(session) else {
                    return send(out, &ImapResponse::no(tag, "No mailbox selected")).await;
                };
                let result = selected.move_messages(&mailbox).await;
                self.reply_unsupported(tag, session, result, out).await
            }
            ImapCommand::Expunge { uids } => self.handle_expunge(tag, uids, session, out).await,

            ImapCommand::StartTls | ImapCommand::Authenticate { .. } => {
                send(out, &ImapResponse::bad(tag, "Command not allowed here")).await
            }
            ImapCommand::Unknown { command } => {
                send(out, &ImapResponse::bad(tag, &format!("Unknown command: {}", command))).await
            }
        }
    }

    /// Verify credentials and move the session to the authenticated state
    async fn complete_login(
        &self,
        tag: &str,
        username: &str,
        password: &str,
        verb: &str,
        session: &mut ImapSession,
    ) -> String {
        match self.backend.login(username, password).await {
            Ok(user) => {
                info!(session = %session.id, user = %user.username, "IMAP login successful");
                session.authenticate(user);
                ImapResponse::ok(tag, &format!("{} completed", verb))
            }
            Err(e) => {
                warn!(session = %session.id, username = %username, error = %e, "IMAP login failed");
                ImapResponse::error(tag, &e)
            }
        }
    }

    /// Handle AUTHENTICATE PLAIN, with or without an initial response.
    /// Returns false when the connection must be closed because the client
    /// left or went silent during the exchange.
    async fn handle_authenticate<T>(
        &self,
        tag: &str,
        mechanism: &str,
        initial_response: Option<String>,
        session: &mut ImapSession,
        stream: &mut T,
    ) -> Result<bool>
    where
        T: AsyncBufRead + AsyncWrite + Unpin + Send,
    {
        let refusal = if session.is_authenticated() {
            Some(ImapResponse::bad(tag, "Already authenticated"))
        } else if !mechanism.eq_ignore_ascii_case("PLAIN") {
            Some(ImapResponse::no(tag, "Unsupported authentication mechanism"))
        } else if self.login_disabled(session) {
            Some(ImapResponse::no_with_code(
                tag,
                "PRIVACYREQUIRED",
                "Authentication disabled, use STARTTLS",
            ))
        } else {
            None
        };
        if let Some(response) = refusal {
            send(stream, &response).await?;
            return Ok(true);
        }

        let response = match initial_response {
            Some(response) => response,
            None => {
                send(stream, &ImapResponse::continue_req()).await?;
                stream.flush().await?;
                let idle_timeout =
                    Duration::from_secs(self.config.timeout_minutes.saturating_mul(60));
                let mut line = String::new();
                let mut limited = (&mut *stream).take(MAX_AUTH_LINE);
                match tokio::time::timeout(idle_timeout, limited.read_line(&mut line)).await {
                    Ok(Ok(0)) => return Ok(false),
                    Ok(Ok(_)) => line,
                    Ok(Err(e)) => return Err(e.into()),
                    Err(_) => {
                        warn!(session = %session.id, "IMAP AUTHENTICATE timed out");
                        send(stream, &ImapResponse::bye(AUTOLOGOUT)).await?;
                        return Ok(false);
                    }
                }
            }
        };

        let reply = match sasl::decode_plain(&response) {
            Ok(credentials) => {
                self.complete_login(
                    tag,
                    &credentials.username,
                    &credentials.secret,
                    "AUTHENTICATE",
                    session,
                )
                .await
            }
            Err(SaslError::Cancelled) => ImapResponse::bad(tag, "AUTHENTICATE cancelled"),
            Err(e) => {
                debug!(session = %session.id, error = %e, "Malformed AUTHENTICATE response");
                ImapResponse::bad(tag, "Invalid SASL response")
            }
        };
        send(stream, &reply).await?;
        Ok(true)
    }

    /// Handle SELECT/EXAMINE command
    async fn handle_select<W>(
        &self,
        tag: &str,
        name: &str,
        readonly: bool,
        session: &mut ImapSession,
        out: &mut W,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let Some(user) = session.user.clone() else {
            return send(out, &ImapResponse::no(tag, "Not authenticated")).await;
        };

        // A failed SELECT leaves no mailbox selected
        session.close_mailbox();

        let mailbox = match self.backend.get_mailbox(&user, name).await {
            Ok(mailbox) => mailbox,
            Err(e) => return send(out, &ImapResponse::error(tag, &e)).await,
        };

        let (status, uids) = match tokio::try_join!(mailbox.status(), mailbox.uid_snapshot()) {
            Ok(loaded) => loaded,
            Err(e) => {
                error!(mailbox = %mailbox.name(), error = %e, "Failed to open mailbox");
                return send(out, &ImapResponse::error(tag, &e)).await;
            }
        };

        let selected = SelectedMailbox::new(mailbox, uids);
        let permanent: &[Flag] = if readonly { &[] } else { &PERMANENT_FLAGS };

        let mut response = String::new();
        response.push_str(&ImapResponse::mailbox_flags(&PERMANENT_FLAGS));
        response.push_str(&ImapResponse::permanent_flags(permanent));
        response.push_str(&ImapResponse::exists(selected.exists()));
        response.push_str(&ImapResponse::recent(status.recent));
        response.push_str(&ImapResponse::uid_validity(status.uid_validity));
        response.push_str(&ImapResponse::uid_next(status.uid_next));

        let (mode, verb) = if readonly {
            ("[READ-ONLY]", "EXAMINE")
        } else {
            ("[READ-WRITE]", "SELECT")
        };
        response.push_str(&ImapResponse::ok(tag, &format!("{} {} completed", mode, verb)));

        debug!(session = %session.id, mailbox = %selected.mailbox.name(), readonly, "Mailbox selected");
        session.select(selected, readonly);
        send(out, &response).await
    }

    /// Handle LIST and LSUB
    async fn handle_list<W>(
        &self,
        tag: &str,
        reference: &str,
        pattern: &str,
        lsub: bool,
        session: &mut ImapSession,
        out: &mut W,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let Some(user) = session.user.clone() else {
            return send(out, &ImapResponse::no(tag, "Not authenticated")).await;
        };
        let verb = if lsub { "LSUB" } else { "LIST" };

        if pattern.is_empty() && !lsub {
            // Hierarchy delimiter query
            send(out, &ImapResponse::list(&["\\Noselect"], "")).await?;
            return send(out, &ImapResponse::ok(tag, "LIST completed")).await;
        }

        let names = match self.backend.list_mailboxes(&user).await {
            Ok(names) => names,
            Err(e) => return send(out, &ImapResponse::error(tag, &e)).await,
        };

        let full_pattern = format!("{}{}", reference, pattern);
        for name in names.iter().filter(|name| matches_pattern(name, &full_pattern)) {
            let line = if lsub {
                ImapResponse::lsub(&["\\HasNoChildren"], name)
            } else {
                ImapResponse::list(&["\\HasNoChildren"], name)
            };
            send(out, &line).await?;
        }

        send(out, &ImapResponse::ok(tag, &format!("{} completed", verb))).await
    }

    /// Handle STATUS command
    async fn handle_status<W>(
        &self,
        tag: &str,
        name: &str,
        items: &[String],
        session: &mut ImapSession,
        out: &mut W,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let Some(user) = session.user.clone() else {
            return send(out, &ImapResponse::no(tag, "Not authenticated")).await;
        };

        let status = match self.backend.get_mailbox(&user, name).await {
            Ok(mailbox) => mailbox.status().await,
            Err(e) => Err(e),
        };
        let status = match status {
            Ok(status) => status,
            Err(e) => return send(out, &ImapResponse::error(tag, &e)).await,
        };

        let mut values = Vec::with_capacity(items.len());
        for item in items {
            let value = match item.as_str() {
                "MESSAGES" => ("MESSAGES", status.messages),
                "UNSEEN" => ("UNSEEN", status.unseen),
                "RECENT" => ("RECENT", status.recent),
                "UIDNEXT" => ("UIDNEXT", status.uid_next),
                "UIDVALIDITY" => ("UIDVALIDITY", status.uid_validity),
                other => {
                    let message = format!("Unknown status item: {}", other);
                    return send(out, &ImapResponse::bad(tag, &message)).await;
                }
            };
            values.push(value);
        }

        send(out, &ImapResponse::status(name, &values)).await?;
        send(out, &ImapResponse::ok(tag, "STATUS completed")).await
    }

    /// Handle APPEND; the mailbox must exist but messages cannot be added
    async fn handle_append<W>(
        &self,
        tag: &str,
        name: &str,
        session: &mut ImapSession,
        out: &mut W,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let Some(user) = session.user.clone() else {
            return send(out, &ImapResponse::no(tag, "Not authenticated")).await;
        };
        let result = match self.backend.get_mailbox(&user, name).await {
            Ok(mailbox) => mailbox.create_message().await,
            Err(e) => Err(e),
        };
        self.reply_unsupported(tag, session, result, out).await
    }

    /// Reply to a command the engine always refuses
    async fn reply_unsupported<W>(
        &self,
        tag: &str,
        session: &ImapSession,
        result: Result<(), MailboxError>,
        out: &mut W,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        if !session.is_authenticated() {
            return send(out, &ImapResponse::no(tag, "Not authenticated")).await;
        }
        let response = match result {
            Ok(()) => ImapResponse::ok(tag, "Completed"),
            Err(e) => ImapResponse::error(tag, &e),
        };
        send(out, &response).await
    }

    /// Handle CLOSE: silently expunge unless read-only, then deselect
    async fn handle_close<W>(&self, tag: &str, session: &mut ImapSession, out: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let Some(mailbox) = selected_mailbox(session) else {
            return send(out, &ImapResponse::no(tag, "No mailbox selected")).await;
        };

        if !session.is_readonly() {
            if let Err(e) = mailbox.expunge(None).await {
                warn!(mailbox = %mailbox.name(), error = %e, "Expunge on CLOSE failed");
            }
        }

        session.close_mailbox();
        send(out, &ImapResponse::ok(tag, "CLOSE completed")).await
    }

    /// Handle FETCH and UID FETCH
    async fn handle_fetch<W>(
        &self,
        tag: &str,
        sequence: &SequenceSet,
        mut items: Vec<FetchItem>,
        uid: bool,
        session: &mut ImapSession,
        out: &mut W,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let Some(mailbox) = selected_mailbox(session) else {
            return send(out, &ImapResponse::no(tag, "No mailbox selected")).await;
        };

        // UID FETCH always reports the UID
        if uid && !items.contains(&FetchItem::Uid) {
            items.insert(0, FetchItem::Uid);
        }

        let mode = AddressingMode::from_uid_flag(uid);
        let verb = if uid { "UID FETCH" } else { "FETCH" };
        match stream_messages(&mailbox, sequence, mode, &items, out).await? {
            Ok(()) => send(out, &ImapResponse::ok(tag, &format!("{} completed", verb))).await,
            Err(e) => send(out, &ImapResponse::error(tag, &e)).await,
        }
    }

    /// Handle SEARCH and UID SEARCH
    async fn handle_search<W>(
        &self,
        tag: &str,
        predicate: &SearchPredicate,
        uid: bool,
        session: &mut ImapSession,
        out: &mut W,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let Some(mailbox) = selected_mailbox(session) else {
            return send(out, &ImapResponse::no(tag, "No mailbox selected")).await;
        };

        match mailbox
            .search(predicate, AddressingMode::from_uid_flag(uid))
            .await
        {
            Ok(ids) => {
                send(out, &ImapResponse::search(&ids)).await?;
                let verb = if uid { "UID SEARCH" } else { "SEARCH" };
                send(out, &ImapResponse::ok(tag, &format!("{} completed", verb))).await
            }
            Err(e) => send(out, &ImapResponse::error(tag, &e)).await,
        }
    }

    /// Handle STORE and UID STORE
    async fn handle_store<W>(
        &self,
        tag: &str,
        sequence: &SequenceSet,
        flags: &StoreFlags,
        uid: bool,
        session: &mut ImapSession,
        out: &mut W,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let Some(mailbox) = selected_mailbox(session) else {
            return send(out, &ImapResponse::no(tag, "No mailbox selected")).await;
        };
        if session.is_readonly() {
            return send(out, &ImapResponse::no(tag, "Mailbox is read-only")).await;
        }

        let mode = AddressingMode::from_uid_flag(uid);
        if let Err(e) = mailbox
            .update_flags(sequence, mode, flags.operation, &flags.flags)
            .await
        {
            return send(out, &ImapResponse::error(tag, &e)).await;
        }

        if !flags.silent {
            let items = if uid {
                vec![FetchItem::Uid, FetchItem::Flags]
            } else {
                vec![FetchItem::Flags]
            };
            if let Err(e) = stream_messages(&mailbox, sequence, mode, &items, out).await? {
                warn!(mailbox = %mailbox.name(), error = %e, "Failed to report updated flags");
            }
        }

        let verb = if uid { "UID STORE" } else { "STORE" };
        send(out, &ImapResponse::ok(tag, &format!("{} completed", verb))).await
    }

    /// Handle EXPUNGE and UID EXPUNGE
    async fn handle_expunge<W>(
        &self,
        tag: &str,
        uids: Option<SequenceSet>,
        session: &mut ImapSession,
        out: &mut W,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let Some(mailbox) = selected_mailbox(session) else {
            return send(out, &ImapResponse::no(tag, "No mailbox selected")).await;
        };
        if session.is_readonly() {
            return send(out, &ImapResponse::no(tag, "Mailbox is read-only")).await;
        }

        let targets = match uids {
            None => None,
            Some(set) => match deleted_targets(&mailbox, &set).await {
                Ok(targets) => Some(targets),
                Err(e) => return send(out, &ImapResponse::error(tag, &e)).await,
            },
        };

        if let Err(e) = mailbox.expunge(targets.as_deref()).await {
            return send(out, &ImapResponse::error(tag, &e)).await;
        }

        if let Err(e) = self.refresh(session, out).await? {
            warn!(mailbox = %mailbox.name(), error = %e, "Failed to report expunged messages");
        }

        let verb = if targets.is_some() { "UID EXPUNGE" } else { "EXPUNGE" };
        send(out, &ImapResponse::ok(tag, &format!("{} completed", verb))).await
    }

    /// Report messages removed or added since the client's last view
    async fn refresh<W>(
        &self,
        session: &mut ImapSession,
        out: &mut W,
    ) -> Result<Result<(), MailboxError>>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let Some(selected) = session.selected.as_mut() else {
            return Ok(Ok(()));
        };

        let current = match selected.mailbox.uid_snapshot().await {
            Ok(uids) => uids,
            Err(e) => return Ok(Err(e)),
        };

        let known = selected.exists();
        let expunged = selected.sync(current);
        for seq in &expunged {
            send(out, &ImapResponse::expunge(*seq)).await?;
        }

        let remaining = known.saturating_sub(expunged.len() as u32);
        if selected.exists() != remaining {
            send(out, &ImapResponse::exists(selected.exists())).await?;
        }
        Ok(Ok(()))
    }
}

async fn send<W>(out: &mut W, data: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    out.write_all(data.as_bytes()).await?;
    Ok(())
}

fn selected_mailbox(session: &ImapSession) -> Option<Mailbox> {
    session
        .selected
        .as_ref()
        .map(|selected| selected.mailbox.clone())
}

/// Tag and command name only, so credentials never reach the log
fn command_summary(line: &str) -> String {
    let mut words = line.split_whitespace();
    let tag = words.next().unwrap_or_default();
    let mut name = words.next().unwrap_or_default().to_uppercase();
    if name == "UID" {
        name.push(' ');
        name.push_str(&words.next().unwrap_or_default().to_uppercase());
    }
    format!("{} {}", tag, name)
}

/// Fetch the addressed messages and write one FETCH line per message as it
/// arrives. The outer error is an I/O failure, the inner one an engine
/// failure that still allows a tagged reply.
async fn stream_messages<W>(
    mailbox: &Mailbox,
    sequence: &SequenceSet,
    mode: AddressingMode,
    items: &[FetchItem],
    out: &mut W,
) -> Result<Result<(), MailboxError>>
where
    W: AsyncWrite + Unpin + Send,
{
    let (tx, mut rx) = mpsc::channel::<FetchedMessage>(FETCH_CHANNEL_CAPACITY);

    let producer = mailbox.list_messages(sequence, mode, items, tx);
    let consumer = async {
        while let Some(message) = rx.recv().await {
            send(out, &ImapResponse::fetch(message.sequence, &message.values)).await?;
        }
        Ok::<(), anyhow::Error>(())
    };

    let (listed, written) = tokio::join!(producer, consumer);
    written?;
    Ok(listed)
}

/// UIDs in `set` that are marked deleted; UID EXPUNGE leaves the rest alone
async fn deleted_targets(mailbox: &Mailbox, set: &SequenceSet) -> Result<Vec<u32>, MailboxError> {
    let requested = mailbox.resolve(set, AddressingMode::Uid).await?;
    let deleted = mailbox
        .search(
            &SearchPredicate {
                with_flags: vec![Flag::Deleted],
                ..Default::default()
            },
            AddressingMode::Uid,
        )
        .await?;
    Ok(requested
        .into_iter()
        .filter(|uid| deleted.binary_search(uid).is_ok())
        .collect())
}

/// LIST pattern match: `*` matches anything, `%` anything but the
/// hierarchy delimiter. Case-insensitive, as mailbox names are addresses.
fn matches_pattern(name: &str, pattern: &str) -> bool {
    fn matches(name: &[u8], pattern: &[u8], delimiter: u8) -> bool {
        match pattern.split_first() {
            None => name.is_empty(),
            Some((b'*', rest)) => (0..=name.len()).any(|i| matches(&name[i..], rest, delimiter)),
            Some((b'%', rest)) => (0..=name.len())
                .take_while(|&i| i == 0 || name[i - 1] != delimiter)
                .any(|i| matches(&name[i..], rest, delimiter)),
            Some((&expected, rest)) => {
                name.first()
                    .is_some_and(|c| c.eq_ignore_ascii_case(&expected))
                    && matches(&name[1..], rest, delimiter)
            }
        }
    }

    let delimiter = DELIMITER.as_bytes().first().copied().unwrap_or(b'/');
    matches(name.as_bytes(), pattern.as_bytes(), delimiter)
}
