//! Command parsing and dispatch.
//!
//! Turns the text of a request frame into a [`Command`], runs it against the
//! storage capability and wraps the outcome as a [`Response`]. Every failure
//! becomes an `ERROR` response; nothing propagates to the connection.

use crate::protocol::Response;
use crate::storage::{DirStorage, FileStorage, StorageError};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::borrow::Cow;
use std::path::Path;
use tracing::{debug, warn};

/// Requests longer than this are shortened in logs
const MAX_LOG_LEN: usize = 200;

/// A parsed request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Lower-cased command name
    pub name: String,
    pub params: Vec<String>,
}

impl Command {
    /// Split request text on whitespace; `None` if there are no tokens.
    pub fn parse(text: &str) -> Option<Self> {
        let mut tokens = text.split_whitespace();
        let name = tokens.next()?.to_lowercase();
        let params = tokens.map(str::to_string).collect();
        Some(Command { name, params })
    }
}

/// Dispatches commands to a storage backend
pub struct Dispatcher {
    storage: Box<dyn FileStorage>,
}

impl Dispatcher {
    pub fn new(storage: Box<dyn FileStorage>) -> Self {
        Self { storage }
    }

    /// Dispatcher over a directory, creating it if needed
    pub fn open(root: impl AsRef<Path>) -> std::io::Result<Self> {
        Ok(Self::new(Box::new(DirStorage::open(root)?)))
    }

    /// Handle the text of one request frame.
    pub fn handle(&self, text: &str) -> Response {
        let Some(command) = Command::parse(text) else {
            warn!("Empty request received");
            return Response::error("Empty request received");
        };
        debug!(request = %log_preview(text), "Dispatching request");
        self.execute(&command)
    }

    /// Execute a parsed command
    pub fn execute(&self, command: &Command) -> Response {
        let params = &command.params;
        match command.name.as_str() {
            "list" => self.list(),
            "get" => match params.first() {
                Some(name) => self.get(name),
                None => Response::error("Filename not provided for GET"),
            },
            "upload" => match (params.first(), params.get(1)) {
                (Some(name), Some(content)) => self.upload(name, content),
                _ => Response::error("UPLOAD command requires filename and content."),
            },
            "delete" => match params.first() {
                Some(name) => self.delete(name),
                None => Response::error("Filename not provided for DELETE"),
            },
            other => {
                warn!(command = other, "Unknown command");
                Response::error(format!("Request command '{}' not recognized", other))
            }
        }
    }

    fn list(&self) -> Response {
        match self.storage.list() {
            Ok(names) => Response::ok(names),
            Err(e) => Response::error(e.to_string()),
        }
    }

    fn get(&self, name: &str) -> Response {
        match self.storage.get(name) {
            Ok(contents) => Response::file(name, STANDARD.encode(contents)),
            Err(StorageError::InvalidName(_)) => {
                Response::error(format!("Invalid filename '{}' for GET.", name))
            }
            Err(StorageError::NotFound(_)) => Response::error(format!("File '{}' not found.", name)),
            Err(e) => Response::error(e.to_string()),
        }
    }

    fn upload(&self, name: &str, content_b64: &str) -> Response {
        let contents = match STANDARD.decode(content_b64) {
            Ok(contents) => contents,
            Err(e) => return Response::error(format!("Invalid Base64 content for UPLOAD: {}", e)),
        };
        match self.storage.upload(name, &contents) {
            Ok(()) => Response::ok(format!(
                "File '{}' uploaded successfully to {}.",
                name,
                self.storage.location()
            )),
            Err(StorageError::InvalidName(_)) => {
                Response::error(format!("Invalid filename '{}' for UPLOAD.", name))
            }
            Err(e) => Response::error(e.to_string()),
        }
    }

    fn delete(&self, name: &str) -> Response {
        match self.storage.delete(name) {
            Ok(()) => Response::ok(format!(
                "File '{}' deleted successfully from {}.",
                name,
                self.storage.location()
            )),
            Err(StorageError::InvalidName(_)) => {
                Response::error(format!("Invalid filename '{}' for DELETE.", name))
            }
            Err(StorageError::NotFound(_)) => {
                Response::error(format!("File '{}' not found for deletion.", name))
            }
            Err(e) => Response::error(e.to_string()),
        }
    }
}

/// Shorten a request for logging, never echoing upload content.
pub fn log_preview(text: &str) -> Cow<'_, str> {
    if text.len() <= MAX_LOG_LEN {
        return Cow::Borrowed(text);
    }
    let mut tokens = text.split_whitespace();
    match (tokens.next(), tokens.next()) {
        (Some(cmd), Some(name)) if cmd.eq_ignore_ascii_case("upload") => Cow::Owned(format!(
            "{} {} [content elided, {} bytes total]",
            cmd,
            name,
            text.len()
        )),
        _ => {
            let mut end = MAX_LOG_LEN;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            Cow::Owned(format!("{}... [{} bytes total]", &text[..end], text.len()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Status;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn dispatcher() -> (tempfile::TempDir, Dispatcher) {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = Dispatcher::open(dir.path()).unwrap();
        (dir, dispatcher)
    }

    fn listing(response: &Response) -> Vec<String> {
        match &response.data {
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| v.as_str().unwrap().to_string())
                .collect(),
            other => panic!("not a listing: {:?}", other),
        }
    }

    /// Storage that counts calls and fails every one of them
    struct FailingStorage {
        calls: Arc<AtomicUsize>,
    }

    impl FileStorage for FailingStorage {
        fn list(&self) -> Result<Vec<String>, StorageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(StorageError::Io(std::io::Error::other("disk on fire")))
        }
        fn get(&self, _name: &str) -> Result<Vec<u8>, StorageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(StorageError::Io(std::io::Error::other("disk on fire")))
        }
        fn upload(&self, _name: &str, _contents: &[u8]) -> Result<(), StorageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(StorageError::Io(std::io::Error::other("disk on fire")))
        }
        fn delete(&self, _name: &str) -> Result<(), StorageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(StorageError::Io(std::io::Error::other("disk on fire")))
        }
        fn location(&self) -> String {
            "nowhere".to_string()
        }
    }

    #[test]
    fn test_parse_command() {
        let command = Command::parse("  UpLoAd  a.txt   aGk= ").unwrap();
        assert_eq!(command.name, "upload");
        assert_eq!(command.params, vec!["a.txt", "aGk="]);

        assert!(Command::parse("").is_none());
        assert!(Command::parse(" \t\r\n ").is_none());
    }

    #[test]
    fn test_empty_request() {
        let (_dir, dispatcher) = dispatcher();
        let response = dispatcher.handle("   ");
        assert_eq!(response.status, Status::Error);
        assert_eq!(response.message(), "Empty request received");
    }

    #[test]
    fn test_unknown_command() {
        let (_dir, dispatcher) = dispatcher();
        let response = dispatcher.handle("FROBNICATE x y");
        assert_eq!(response.status, Status::Error);
        assert_eq!(response.message(), "Request command 'frobnicate' not recognized");
    }

    #[test]
    fn test_upload_get_roundtrip() {
        let (_dir, dispatcher) = dispatcher();
        let contents: Vec<u8> = (0..=255u8).rev().cycle().take(4096).collect();
        let encoded = STANDARD.encode(&contents);

        let response = dispatcher.handle(&format!("UPLOAD data.bin {}", encoded));
        assert!(response.is_ok(), "{:?}", response);

        let response = dispatcher.handle("get data.bin");
        assert!(response.is_ok());
        assert_eq!(response.data_namafile.as_deref(), Some("data.bin"));
        let returned = STANDARD.decode(response.data_file.unwrap()).unwrap();
        assert_eq!(returned, contents);
    }

    #[test]
    fn test_list_reflects_upload_and_delete() {
        let (_dir, dispatcher) = dispatcher();

        dispatcher.handle("UPLOAD a.txt aGVsbG8=");
        assert!(listing(&dispatcher.handle("LIST")).contains(&"a.txt".to_string()));

        let response = dispatcher.handle("DELETE a.txt");
        assert!(response.is_ok());
        assert!(!listing(&dispatcher.handle("LIST")).contains(&"a.txt".to_string()));
    }

    #[test]
    fn test_missing_parameters() {
        let (_dir, dispatcher) = dispatcher();
        assert_eq!(dispatcher.handle("GET").message(), "Filename not provided for GET");
        assert_eq!(
            dispatcher.handle("UPLOAD a.txt").message(),
            "UPLOAD command requires filename and content."
        );
        assert_eq!(dispatcher.handle("DELETE").message(), "Filename not provided for DELETE");
    }

    #[test]
    fn test_missing_parameters_do_not_touch_storage() {
        let calls = Arc::new(AtomicUsize::new(0));
        let dispatcher = Dispatcher::new(Box::new(FailingStorage {
            calls: Arc::clone(&calls),
        }));

        dispatcher.handle("GET");
        dispatcher.handle("UPLOAD only-name");
        dispatcher.handle("DELETE");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_storage_faults_become_errors() {
        let calls = Arc::new(AtomicUsize::new(0));
        let dispatcher = Dispatcher::new(Box::new(FailingStorage {
            calls: Arc::clone(&calls),
        }));

        for request in ["LIST", "GET a", "UPLOAD a aGk=", "DELETE a"] {
            let response = dispatcher.handle(request);
            assert_eq!(response.status, Status::Error);
            assert_eq!(response.message(), "disk on fire");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_not_found_messages() {
        let (_dir, dispatcher) = dispatcher();
        assert_eq!(dispatcher.handle("GET ghost").message(), "File 'ghost' not found.");
        assert_eq!(
            dispatcher.handle("DELETE ghost").message(),
            "File 'ghost' not found for deletion."
        );
    }

    #[test]
    fn test_invalid_base64() {
        let (_dir, dispatcher) = dispatcher();
        let response = dispatcher.handle("UPLOAD a.txt !!notbase64!!");
        assert_eq!(response.status, Status::Error);
        assert!(response.message().starts_with("Invalid Base64 content for UPLOAD"));
    }

    #[test]
    fn test_path_traversal_rejected() {
        let (_dir, dispatcher) = dispatcher();
        assert_eq!(
            dispatcher.handle("GET ../etc/passwd").message(),
            "Invalid filename '../etc/passwd' for GET."
        );
        assert_eq!(
            dispatcher.handle("UPLOAD /tmp/x aGk=").message(),
            "Invalid filename '/tmp/x' for UPLOAD."
        );
        assert_eq!(
            dispatcher.handle("DELETE ..").message(),
            "Invalid filename '..' for DELETE."
        );
    }

    #[test]
    fn test_log_preview_elides_upload_content() {
        let request = format!("UPLOAD big.bin {}", "A".repeat(1000));
        let preview = log_preview(&request);
        assert!(preview.starts_with("UPLOAD big.bin [content elided"));
        assert!(!preview.contains("AAAA"));

        assert_eq!(log_preview("LIST"), "LIST");
    }
}
