//! Reply mapping — policy outcome and errors to wire replies.
//!
//! Pure functions only; nothing here writes to a socket.

use crate::ftp::commands::{Command, CommandFamily};
use crate::ftp::error::{BridgeError, BridgeErrorKind};
use crate::ftp::message::FtpResponseMetadata;
use crate::ftp::policy::PolicyStatus;
use crate::ftp::types::Reply;

pub const FILE_STATUS_OKAY: u16 = 150;
pub const COMMAND_OKAY: u16 = 200;
pub const CLOSING_DATA_CONNECTION: u16 = 226;
pub const FILE_ACTION_OKAY: u16 = 250;
pub const PATHNAME_CREATED: u16 = 257;
pub const SERVICE_NOT_AVAILABLE: u16 = 421;
pub const CANT_OPEN_DATA_CONNECTION: u16 = 425;
pub const TRANSFER_ABORTED: u16 = 426;
pub const SYNTAX_ERROR_IN_ARGUMENTS: u16 = 501;
pub const NOT_IMPLEMENTED: u16 = 502;
pub const BAD_SEQUENCE: u16 = 503;
pub const ACTION_NOT_TAKEN: u16 = 550;

pub fn file_status_okay(command: Command) -> Reply {
    Reply::new(
        FILE_STATUS_OKAY,
        format!("File status okay; about to open data connection for {}.", command),
    )
}

pub fn closing_data_connection() -> Reply {
    Reply::new(CLOSING_DATA_CONNECTION, "Transfer complete.")
}

pub fn not_implemented(verb: &str) -> Reply {
    Reply::new(NOT_IMPLEMENTED, format!("Command {} not implemented.", verb))
}

pub fn processing_error(command: Command) -> Reply {
    Reply::new(
        ACTION_NOT_TAKEN,
        format!("Error processing FTP(S) {} request.", command),
    )
}

/// The one wire reply for a bridge error.
pub fn for_error(err: &BridgeError, command: Command) -> Reply {
    let reply = match err.kind {
        BridgeErrorKind::InvalidArgument => Reply::new(
            SYNTAX_ERROR_IN_ARGUMENTS,
            "Syntax error in parameters or arguments.",
        ),
        BridgeErrorKind::BadSequence => {
            Reply::new(BAD_SEQUENCE, "PORT or PASV must be issued first")
        }
        BridgeErrorKind::TypeMismatch => Reply::new(ACTION_NOT_TAKEN, &err.message),
        BridgeErrorKind::DataConnectionFailed => {
            Reply::new(CANT_OPEN_DATA_CONNECTION, "Can't open data connection.")
        }
        BridgeErrorKind::TransferAborted => {
            Reply::new(TRANSFER_ABORTED, "Data connection error; transfer aborted.")
        }
        BridgeErrorKind::CapacityExceeded => {
            Reply::new(SERVICE_NOT_AVAILABLE, "Max connections exceeded.")
        }
        BridgeErrorKind::PolicyFailure
        | BridgeErrorKind::ProtocolInconsistency
        | BridgeErrorKind::RequestCreation
        | BridgeErrorKind::InvalidConfig
        | BridgeErrorKind::TlsFailed
        | BridgeErrorKind::IoError => processing_error(command),
    };
    match err.code {
        Some(code) => Reply::multi(code, reply.lines),
        None => reply,
    }
}

/// What the bridge does after the policy returned.
#[derive(Debug)]
pub enum Interpretation {
    /// Close the control connection without replying.
    Stealth,
    Failed(BridgeError),
    /// Success; the reply the policy asked for.
    Proceed(Reply),
}

/// Stealth first, then status, then metadata presence.
pub fn interpret(
    status: PolicyStatus,
    stealth: bool,
    metadata: Option<&FtpResponseMetadata>,
) -> Interpretation {
    if stealth {
        return Interpretation::Stealth;
    }
    if !status.is_success() {
        return Interpretation::Failed(BridgeError::policy_failure(format!(
            "message processing failed: {}",
            status
        )));
    }
    match metadata {
        Some(md) => Interpretation::Proceed(Reply::new(md.code, &md.text)),
        None => Interpretation::Failed(BridgeError::inconsistency(
            "response has no FTP metadata after a successful policy outcome",
        )),
    }
}

/// Final reply for a data command. The expected completion code maps to
/// the canonical 226, anything else is forwarded verbatim.
pub fn data_completion(command: Command, reply: Reply) -> Reply {
    let expected = reply.code == CLOSING_DATA_CONNECTION
        || (command.family() == CommandFamily::Download && reply.code == FILE_STATUS_OKAY);
    if expected {
        closing_data_connection()
    } else {
        reply
    }
}

/// Navigation reply, defaulting blank text to the new working path.
pub fn navigation(reply: Reply, path: &str) -> Reply {
    if reply.text().trim().is_empty() {
        Reply::new(reply.code, format!("Directory changed to {}", path))
    } else {
        reply
    }
}

/// Simple-command reply, verbatim unless the policy left the text blank.
pub fn simple(command: Command, reply: Reply, path: &str) -> Reply {
    if !reply.text().trim().is_empty() {
        return reply;
    }
    let text = match command {
        Command::Pwd => format!("\"{}\" is current directory.", path),
        Command::Noop => "Command okay.".to_string(),
        _ => format!("{} okay.", command),
    };
    Reply::new(reply.code, text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping() {
        let cases = [
            (BridgeError::invalid_argument("x"), 501),
            (BridgeError::bad_sequence("x"), 503),
            (BridgeError::type_mismatch("Type 'ASCII' not supported for this action."), 550),
            (BridgeError::data_connection("x"), 425),
            (BridgeError::transfer_aborted("x"), 426),
            (BridgeError::capacity("x"), 421),
            (BridgeError::policy_failure("x"), 550),
            (BridgeError::inconsistency("x"), 550),
        ];
        for (err, code) in cases {
            assert_eq!(for_error(&err, Command::Stor).code, code, "{}", err);
        }
        let reply = for_error(&BridgeError::policy_failure("denied"), Command::Retr);
        assert_eq!(reply.text(), "Error processing FTP(S) RETR request.");
        let reply = for_error(&BridgeError::type_mismatch("Type 'ASCII' not supported for this action."), Command::Stor);
        assert_eq!(reply.text(), "Type 'ASCII' not supported for this action.");
    }

    #[test]
    fn test_interpret_order() {
        let md = FtpResponseMetadata::new(226, "ok");
        assert!(matches!(
            interpret(PolicyStatus::Falsified, true, None),
            Interpretation::Stealth
        ));
        assert!(matches!(
            interpret(PolicyStatus::Falsified, false, Some(&md)),
            Interpretation::Failed(BridgeError { kind: BridgeErrorKind::PolicyFailure, .. })
        ));
        assert!(matches!(
            interpret(PolicyStatus::Success, false, None),
            Interpretation::Failed(BridgeError { kind: BridgeErrorKind::ProtocolInconsistency, .. })
        ));
        assert!(matches!(
            interpret(PolicyStatus::Success, false, Some(&md)),
            Interpretation::Proceed(Reply { code: 226, .. })
        ));
    }

    #[test]
    fn test_data_completion() {
        let canonical = data_completion(Command::Stor, Reply::new(226, "whatever"));
        assert_eq!(canonical, closing_data_connection());
        let from_150 = data_completion(Command::Retr, Reply::new(150, "routed"));
        assert_eq!(from_150.code, 226);
        let upload_150 = data_completion(Command::Stor, Reply::new(150, "routed"));
        assert_eq!(upload_150.code, 150);
        let partial = data_completion(Command::List, Reply::new(451, "partial"));
        assert_eq!(partial, Reply::new(451, "partial"));
    }

    #[test]
    fn test_blank_text_defaults() {
        assert_eq!(navigation(Reply::new(250, " "), "/x").text(), "Directory changed to /x");
        assert_eq!(navigation(Reply::new(250, "moved"), "/x").text(), "moved");
        assert_eq!(
            simple(Command::Pwd, Reply::new(257, ""), "/a").text(),
            "\"/a\" is current directory."
        );
        assert_eq!(simple(Command::Size, Reply::new(213, "42"), "/").text(), "42");
    }
}
