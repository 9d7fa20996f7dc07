//! Executes parsed command lines against the registry and file store.

use std::sync::Arc;

use chrono::Local;
use futures_util::future::join_all;
use tracing::{debug, info, warn};

use crate::{
    protocol::{
        broadcast_line, unicast_line, Command, CommandError, Verb, DIRECTORY_HEADER, FAREWELL,
        HELP_LINES, JOIN_OK, MESSAGE_SENT,
    },
    registry::{Registry, RegistryError},
    session::Session,
    store::{is_plain_name, FileStore, StoreError},
};

/// Whether the session keeps reading after the reply is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// Lines to write back to the calling session, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub lines: Vec<String>,
    pub flow: Flow,
}

impl Reply {
    fn line(line: impl Into<String>) -> Self {
        Self::lines(vec![line.into()])
    }

    fn lines(lines: Vec<String>) -> Self {
        Self {
            lines,
            flow: Flow::Continue,
        }
    }

    fn none() -> Self {
        Self::lines(Vec::new())
    }

    fn close(line: impl Into<String>) -> Self {
        Self {
            lines: vec![line.into()],
            flow: Flow::Close,
        }
    }
}

impl From<CommandError> for Reply {
    fn from(err: CommandError) -> Self {
        Reply::line(err.to_string())
    }
}

pub struct Dispatcher {
    registry: Arc<Registry>,
    store: Arc<FileStore>,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, store: Arc<FileStore>) -> Self {
        Self { registry, store }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn store(&self) -> &FileStore {
        &self.store
    }

    /// Runs one line from `session` and returns what to send back to it.
    ///
    /// Failures become a single error line; a failed command changes no
    /// registry or store state.
    pub async fn dispatch(&self, session: &mut Session, line: &str) -> Reply {
        let command = match Command::parse(line) {
            Ok(command) => command,
            Err(err) => return err.into(),
        };

        let result = match command.verb {
            Verb::Join => join(&command),
            Verb::Leave => Ok(Reply::close(FAREWELL)),
            Verb::Register => self.register(session, &command).await,
            Verb::Store => self.upload(session, &command).await,
            Verb::Dir => self.list(session).await,
            Verb::Get => self.download(session, &command).await,
            Verb::Broadcast => self.broadcast(session, &command).await,
            Verb::Unicast => self.unicast(session, &command).await,
            Verb::Help => Ok(Reply::lines(
                HELP_LINES.iter().map(|line| line.to_string()).collect(),
            )),
        };

        result.unwrap_or_else(Reply::from)
    }

    async fn register(
        &self,
        session: &mut Session,
        command: &Command,
    ) -> Result<Reply, CommandError> {
        let args = command.exact_args(1)?;
        let handle = &args[0];

        if let Some(current) = session.handle() {
            return Err(CommandError::AlreadyRegistered(current.to_string()));
        }
        if !is_plain_name(handle) {
            return Err(CommandError::InvalidHandle);
        }

        match self
            .registry
            .register(handle, session.id(), session.outbox().clone())
            .await
        {
            Ok(()) => {}
            Err(RegistryError::HandleTaken(_)) => return Err(CommandError::HandleTaken),
        }
        session.set_handle(handle.clone());
        info!(peer = ?session.peer(), %handle, "client registered");

        if let Err(err) = self.store.prepare_client_area(handle).await {
            warn!(%handle, error = ?err, "failed to create client area");
        }

        Ok(Reply::line(format!("Welcome {handle}!")))
    }

    async fn upload(&self, session: &Session, command: &Command) -> Result<Reply, CommandError> {
        let filename = &command.exact_args(1)?[0];
        let handle = registered(session)?;

        match self.store.upload(handle, filename).await {
            Ok(_) => {
                let stamp = Local::now().format("%a %b %d %H:%M:%S %Z %Y");
                Ok(Reply::line(format!("{handle}<{stamp}>: Uploaded {filename}")))
            }
            Err(StoreError::InvalidName(_)) => Err(CommandError::InvalidFilename),
            Err(StoreError::SourceMissing(_)) => Err(CommandError::SourceMissing),
            Err(StoreError::AlreadyExists(_)) => Err(CommandError::AlreadyStored),
            Err(StoreError::NotFound(_)) => Err(CommandError::SourceMissing),
            Err(StoreError::Io(err)) => {
                warn!(%handle, %filename, error = ?err, "upload failed");
                Err(CommandError::UploadFailed(err))
            }
        }
    }

    async fn list(&self, session: &Session) -> Result<Reply, CommandError> {
        registered(session)?;

        // An unreadable store reads as empty, like a directory with no entries.
        let names = match self.store.list().await {
            Ok(names) => names,
            Err(err) => {
                warn!(error = ?err, "failed to list shared store");
                Vec::new()
            }
        };
        if names.is_empty() {
            return Err(CommandError::NoFiles);
        }

        let mut lines = Vec::with_capacity(names.len() + 1);
        lines.push(DIRECTORY_HEADER.to_string());
        lines.extend(names);
        Ok(Reply::lines(lines))
    }

    async fn download(&self, session: &Session, command: &Command) -> Result<Reply, CommandError> {
        let filename = &command.exact_args(1)?[0];
        let handle = registered(session)?;

        match self.store.download(handle, filename).await {
            Ok(_) => Ok(Reply::line(format!("File received from Server: {filename}"))),
            Err(StoreError::InvalidName(_)) => Err(CommandError::InvalidFilename),
            Err(StoreError::NotFound(_)) => Err(CommandError::FileNotFound),
            Err(StoreError::SourceMissing(_)) | Err(StoreError::AlreadyExists(_)) => {
                Err(CommandError::FileNotFound)
            }
            Err(StoreError::Io(err)) => {
                warn!(%handle, %filename, error = ?err, "download failed");
                Err(CommandError::DownloadFailed(err))
            }
        }
    }

    /// Pushes the message to every registered session, the sender included.
    async fn broadcast(&self, session: &Session, command: &Command) -> Result<Reply, CommandError> {
        let handle = registered(session)?;
        command.min_args(1)?;

        let line = broadcast_line(handle, &command.message_from(0));
        let recipients = self.registry.recipients().await;
        let deliveries = recipients.iter().map(|(target, outbox)| {
            let line = &line;
            async move {
                if let Err(err) = outbox.send_line(line).await {
                    debug!(%target, error = ?err, "failed to deliver broadcast");
                }
            }
        });
        join_all(deliveries).await;

        info!(%handle, recipients = recipients.len(), "{line}");
        Ok(Reply::none())
    }

    async fn unicast(&self, session: &Session, command: &Command) -> Result<Reply, CommandError> {
        let handle = registered(session)?;
        let args = command.min_args(2)?;
        let target = &args[0];

        let outbox = self
            .registry
            .lookup(target)
            .await
            .ok_or(CommandError::TargetNotFound)?;
        let message = command.message_from(1);
        if let Err(err) = outbox.send_line(&unicast_line(handle, &message)).await {
            debug!(%target, error = ?err, "failed to deliver unicast");
        }

        info!(from = %handle, to = %target, "message sent: {message}");
        Ok(Reply::line(MESSAGE_SENT))
    }
}

fn join(command: &Command) -> Result<Reply, CommandError> {
    command
        .exact_args(2)
        .map_err(|_| CommandError::JoinFailed)?;
    Ok(Reply::line(JOIN_OK))
}

fn registered(session: &Session) -> Result<&str, CommandError> {
    session.handle().ok_or(CommandError::NotRegistered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{protocol::read_line, session::Outbox};
    use tempfile::TempDir;
    use tokio::{
        fs,
        io::{BufReader, DuplexStream},
    };

    struct Fixture {
        _dir: TempDir,
        dispatcher: Dispatcher,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().expect("tempdir");
        let store = FileStore::open(dir.path().join("server_files"), dir.path())
            .await
            .expect("open store");
        Fixture {
            dispatcher: Dispatcher::new(Arc::new(Registry::new()), Arc::new(store)),
            _dir: dir,
        }
    }

    fn session(dispatcher: &Dispatcher) -> (Session, BufReader<DuplexStream>) {
        let (writer, reader) = tokio::io::duplex(4096);
        let session = Session::new(dispatcher.registry().next_id(), None, Outbox::new(writer));
        (session, BufReader::new(reader))
    }

    async fn registered_session(
        dispatcher: &Dispatcher,
        handle: &str,
    ) -> (Session, BufReader<DuplexStream>) {
        let (mut session, reader) = session(dispatcher);
        let reply = dispatcher
            .dispatch(&mut session, &format!("/register {handle}"))
            .await;
        assert_eq!(reply.lines, vec![format!("Welcome {handle}!")]);
        (session, reader)
    }

    #[tokio::test]
    async fn unknown_verb_is_not_found_without_side_effects() {
        let fx = fixture().await;
        let (mut session, _reader) = session(&fx.dispatcher);

        let reply = fx.dispatcher.dispatch(&mut session, "/teleport home").await;
        assert_eq!(reply.lines, vec!["Error: Command not found."]);
        assert_eq!(reply.flow, Flow::Continue);
        assert!(fx.dispatcher.registry().handles().await.is_empty());
        assert!(fx.dispatcher.store().list().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn join_checks_arity_only() {
        let fx = fixture().await;
        let (mut session, _reader) = session(&fx.dispatcher);

        let ok = fx.dispatcher.dispatch(&mut session, "/join 127.0.0.1 12345").await;
        assert_eq!(ok.lines, vec![JOIN_OK]);
        let bad = fx.dispatcher.dispatch(&mut session, "/join 127.0.0.1").await;
        assert_eq!(bad.lines, vec![CommandError::JoinFailed.to_string()]);
    }

    #[tokio::test]
    async fn leave_closes_after_farewell() {
        let fx = fixture().await;
        let (mut session, _reader) = session(&fx.dispatcher);

        let reply = fx.dispatcher.dispatch(&mut session, "/leave").await;
        assert_eq!(reply, Reply::close(FAREWELL));
    }

    #[tokio::test]
    async fn duplicate_handle_is_rejected_and_first_owner_kept() {
        let fx = fixture().await;
        let (_alice, _alice_reader) = registered_session(&fx.dispatcher, "alice").await;
        let (mut impostor, _reader) = session(&fx.dispatcher);

        let reply = fx.dispatcher.dispatch(&mut impostor, "/register alice").await;
        assert_eq!(reply.lines, vec![CommandError::HandleTaken.to_string()]);
        assert_eq!(impostor.handle(), None);
        assert_eq!(fx.dispatcher.registry().handles().await, vec!["alice"]);
    }

    #[tokio::test]
    async fn register_rejects_second_handle_and_path_names() {
        let fx = fixture().await;
        let (mut alice, _reader) = registered_session(&fx.dispatcher, "alice").await;

        let again = fx.dispatcher.dispatch(&mut alice, "/register alicia").await;
        assert_eq!(
            again.lines,
            vec!["Error: You are already registered as alice."]
        );

        let (mut other, _other_reader) = session(&fx.dispatcher);
        let sneaky = fx.dispatcher.dispatch(&mut other, "/register ../root").await;
        assert_eq!(sneaky.lines, vec![CommandError::InvalidHandle.to_string()]);
        assert_eq!(fx.dispatcher.registry().handles().await, vec!["alice"]);
    }

    #[tokio::test]
    async fn privileged_commands_require_registration() {
        let fx = fixture().await;
        let (mut session, _reader) = session(&fx.dispatcher);

        for line in ["/store a.txt", "/dir", "/get a.txt", "/broadcast hi", "/unicast bob hi"] {
            let reply = fx.dispatcher.dispatch(&mut session, line).await;
            assert_eq!(
                reply.lines,
                vec![CommandError::NotRegistered.to_string()],
                "{line}"
            );
        }
    }

    #[tokio::test]
    async fn store_checks_arity_before_registration() {
        let fx = fixture().await;
        let (mut session, _reader) = session(&fx.dispatcher);

        let reply = fx.dispatcher.dispatch(&mut session, "/store").await;
        assert_eq!(reply.lines, vec![CommandError::BadArguments.to_string()]);
    }

    #[tokio::test]
    async fn store_then_dir_lists_file_once() {
        let fx = fixture().await;
        let (mut alice, _reader) = registered_session(&fx.dispatcher, "alice").await;
        let area = fx.dispatcher.store().client_area("alice");
        fs::write(area.join("plan.txt"), b"step one").await.expect("write");

        let stored = fx.dispatcher.dispatch(&mut alice, "/store plan.txt").await;
        assert_eq!(stored.lines.len(), 1);
        assert!(stored.lines[0].starts_with("alice<"));
        assert!(stored.lines[0].ends_with(">: Uploaded plan.txt"));
        let stamp = stored.lines[0]
            .trim_start_matches("alice<")
            .split('>')
            .next()
            .unwrap_or_default();
        // weekday, month, day, time, zone, year
        assert_eq!(stamp.split_whitespace().count(), 6, "{stamp}");

        let listing = fx.dispatcher.dispatch(&mut alice, "/dir").await;
        assert_eq!(listing.lines, vec![DIRECTORY_HEADER, "plan.txt"]);

        let again = fx.dispatcher.dispatch(&mut alice, "/store plan.txt").await;
        assert_eq!(again.lines, vec![CommandError::AlreadyStored.to_string()]);
    }

    #[tokio::test]
    async fn copy_failures_report_their_reason() {
        let fx = fixture().await;
        let (mut alice, _reader) = registered_session(&fx.dispatcher, "alice").await;
        let area = fx.dispatcher.store().client_area("alice");

        fs::create_dir(area.join("photos")).await.expect("mkdir");
        let upload = fx.dispatcher.dispatch(&mut alice, "/store photos").await;
        assert_eq!(upload.lines.len(), 1);
        assert!(
            upload.lines[0].starts_with("Error: Unable to copy file. "),
            "{:?}",
            upload.lines
        );

        let shared = fx.dispatcher.store().shared_dir().join("song.mp3");
        fs::write(&shared, b"la").await.expect("seed");
        fs::create_dir(area.join("song.mp3")).await.expect("mkdir");
        let download = fx.dispatcher.dispatch(&mut alice, "/get song.mp3").await;
        assert_eq!(download.lines.len(), 1);
        assert!(
            download.lines[0].starts_with("Error: Unable to receive file. "),
            "{:?}",
            download.lines
        );
    }

    #[tokio::test]
    async fn dir_on_empty_store_reports_no_files() {
        let fx = fixture().await;
        let (mut alice, _reader) = registered_session(&fx.dispatcher, "alice").await;

        let reply = fx.dispatcher.dispatch(&mut alice, "/dir").await;
        assert_eq!(reply.lines, vec![CommandError::NoFiles.to_string()]);
    }

    #[tokio::test]
    async fn get_missing_file_reports_not_found() {
        let fx = fixture().await;
        let (mut alice, _reader) = registered_session(&fx.dispatcher, "alice").await;

        let reply = fx.dispatcher.dispatch(&mut alice, "/get nothing.txt").await;
        assert_eq!(reply.lines, vec![CommandError::FileNotFound.to_string()]);
        let local = fx.dispatcher.store().client_area("alice").join("nothing.txt");
        assert!(!fs::try_exists(local).await.expect("exists check"));
    }

    #[tokio::test]
    async fn broadcast_reaches_everyone_including_sender() {
        let fx = fixture().await;
        let (mut alice, mut alice_reader) = registered_session(&fx.dispatcher, "alice").await;
        let (_bob, mut bob_reader) = registered_session(&fx.dispatcher, "bob").await;
        let (_carol, mut carol_reader) = registered_session(&fx.dispatcher, "carol").await;

        let reply = fx
            .dispatcher
            .dispatch(&mut alice, "/broadcast hello   everyone")
            .await;
        assert!(reply.lines.is_empty());

        for reader in [&mut alice_reader, &mut bob_reader, &mut carol_reader] {
            let line = read_line(reader).await.expect("read").expect("line");
            assert_eq!(line, "Broadcast from alice: hello everyone");
        }
    }

    #[tokio::test]
    async fn unicast_delivers_to_target_only() {
        let fx = fixture().await;
        let (mut alice, _alice_reader) = registered_session(&fx.dispatcher, "alice").await;
        let (_bob, mut bob_reader) = registered_session(&fx.dispatcher, "bob").await;

        let reply = fx.dispatcher.dispatch(&mut alice, "/unicast bob hi there").await;
        assert_eq!(reply.lines, vec![MESSAGE_SENT]);
        let line = read_line(&mut bob_reader).await.expect("read").expect("line");
        assert_eq!(line, "Message from alice: hi there");

        let missing = fx.dispatcher.dispatch(&mut alice, "/unicast zed hi").await;
        assert_eq!(missing.lines, vec![CommandError::TargetNotFound.to_string()]);

        let short = fx.dispatcher.dispatch(&mut alice, "/unicast bob").await;
        assert_eq!(short.lines, vec![CommandError::BadArguments.to_string()]);
    }

    #[tokio::test]
    async fn help_lists_grammar() {
        let fx = fixture().await;
        let (mut session, _reader) = session(&fx.dispatcher);

        let reply = fx.dispatcher.dispatch(&mut session, "/?").await;
        assert_eq!(reply.lines.len(), HELP_LINES.len());
        assert_eq!(reply.lines[0], "/join <server_ip> <port>");
    }
}
