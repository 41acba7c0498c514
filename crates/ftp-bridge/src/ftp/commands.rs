//! Command table — which FTP verbs the bridge answers and how.
//!
//! Routed verbs are a closed [`Command`] enum tagged with their argument and
//! data-connection requirements and the family handler that runs them.
//! A [`Dispatcher`] maps a verb to either a routed command or a built-in,
//! reply-only handler. Two tables exist: the full one, and a restricted
//! upload-only one for connectors without a pinned destination.

use crate::ftp::session::Session;
use crate::ftp::types::{ConnectorConfig, Reply};
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::fmt;

/// Family handler a routed command belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandFamily {
    Upload,
    Download,
    Listing,
    Navigation,
    Simple,
}

/// FTP verbs routed through the policy pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Stor,
    Stou,
    Appe,
    Retr,
    List,
    Nlst,
    Mlsd,
    Cwd,
    Cdup,
    Dele,
    Noop,
    Mkd,
    Rmd,
    Size,
    Mdtm,
    Mlst,
    Pwd,
}

impl Command {
    pub const ALL: [Command; 17] = [
        Command::Stor,
        Command::Stou,
        Command::Appe,
        Command::Retr,
        Command::List,
        Command::Nlst,
        Command::Mlsd,
        Command::Cwd,
        Command::Cdup,
        Command::Dele,
        Command::Noop,
        Command::Mkd,
        Command::Rmd,
        Command::Size,
        Command::Mdtm,
        Command::Mlst,
        Command::Pwd,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Stor => "STOR",
            Self::Stou => "STOU",
            Self::Appe => "APPE",
            Self::Retr => "RETR",
            Self::List => "LIST",
            Self::Nlst => "NLST",
            Self::Mlsd => "MLSD",
            Self::Cwd => "CWD",
            Self::Cdup => "CDUP",
            Self::Dele => "DELE",
            Self::Noop => "NOOP",
            Self::Mkd => "MKD",
            Self::Rmd => "RMD",
            Self::Size => "SIZE",
            Self::Mdtm => "MDTM",
            Self::Mlst => "MLST",
            Self::Pwd => "PWD",
        }
    }

    pub fn family(self) -> CommandFamily {
        match self {
            Self::Stor | Self::Stou | Self::Appe => CommandFamily::Upload,
            Self::Retr => CommandFamily::Download,
            Self::List | Self::Nlst | Self::Mlsd => CommandFamily::Listing,
            Self::Cwd | Self::Cdup => CommandFamily::Navigation,
            Self::Dele
            | Self::Noop
            | Self::Mkd
            | Self::Rmd
            | Self::Size
            | Self::Mdtm
            | Self::Mlst
            | Self::Pwd => CommandFamily::Simple,
        }
    }

    pub fn is_argument_required(self) -> bool {
        matches!(
            self,
            Self::Stor
                | Self::Appe
                | Self::Retr
                | Self::Dele
                | Self::Mkd
                | Self::Rmd
                | Self::Size
                | Self::Mdtm
        )
    }

    pub fn requires_data_connection(self) -> bool {
        matches!(
            self.family(),
            CommandFamily::Upload | CommandFamily::Download | CommandFamily::Listing
        )
    }

    /// STOU asks the destination to pick a unique name.
    pub fn is_unique(self) -> bool {
        self == Self::Stou
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ─── Built-in handlers ───────────────────────────────────────────────

/// Reply-only handler that never reaches the policy.
pub type BuiltinHandler = fn(&Session, Option<&str>) -> Reply;

/// Fixed FEAT list; no runtime negotiation of further extensions.
pub const FEATURES: [&str; 10] = [
    "SIZE",
    "MDTM",
    "REST STREAM",
    "LANG en",
    "MLST Size;Modify;Type;Perm",
    "MODE S",
    "UTF8",
    "EPSV",
    "PASV",
    "TVFS",
];

fn feat(_: &Session, _: Option<&str>) -> Reply {
    let mut lines = Vec::with_capacity(FEATURES.len() + 2);
    lines.push("Extensions supported".to_string());
    lines.extend(FEATURES.iter().map(|f| format!(" {}", f)));
    lines.push("End".to_string());
    Reply::multi(211, lines)
}

fn syst(_: &Session, _: Option<&str>) -> Reply {
    Reply::new(215, "UNIX Type: L8")
}

fn help(_: &Session, _: Option<&str>) -> Reply {
    Reply::new(214, "Commands are routed to the gateway; see FEAT for extensions.")
}

fn allo(_: &Session, _: Option<&str>) -> Reply {
    Reply::new(202, "No storage allocation necessary.")
}

fn noop(_: &Session, _: Option<&str>) -> Reply {
    Reply::new(200, "Command NOOP okay.")
}

fn pwd(session: &Session, _: Option<&str>) -> Reply {
    Reply::new(
        257,
        format!("\"{}\" is current directory.", session.directory.current()),
    )
}

// ─── Dispatch tables ─────────────────────────────────────────────────

/// What a verb resolves to.
#[derive(Clone, Copy)]
pub enum Handler {
    Builtin(BuiltinHandler),
    Bridge(Command),
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Builtin(_) => f.write_str("Builtin"),
            Self::Bridge(cmd) => write!(f, "Bridge({})", cmd),
        }
    }
}

/// Static verb → handler table.
pub struct Dispatcher {
    name: &'static str,
    table: HashMap<&'static str, Handler>,
}

lazy_static! {
    static ref FULL: Dispatcher = Dispatcher::build("full", &Command::ALL, &[]);
    static ref RESTRICTED: Dispatcher = Dispatcher::build(
        "restricted",
        &[Command::Stor, Command::Stou, Command::Appe],
        &[("NOOP", noop as BuiltinHandler), ("PWD", pwd)],
    );
}

impl Dispatcher {
    fn build(
        name: &'static str,
        routed: &[Command],
        extra: &[(&'static str, BuiltinHandler)],
    ) -> Self {
        let mut table: HashMap<&'static str, Handler> = HashMap::new();
        table.insert("FEAT", Handler::Builtin(feat));
        table.insert("SYST", Handler::Builtin(syst));
        table.insert("HELP", Handler::Builtin(help));
        table.insert("ALLO", Handler::Builtin(allo));
        for (verb, handler) in extra {
            table.insert(*verb, Handler::Builtin(*handler));
        }
        for cmd in routed {
            table.insert(cmd.name(), Handler::Bridge(*cmd));
        }
        Self { name, table }
    }

    /// Every supported command.
    pub fn full() -> &'static Dispatcher {
        &FULL
    }

    /// Upload-only table plus informational commands.
    pub fn restricted() -> &'static Dispatcher {
        &RESTRICTED
    }

    /// Table variant selected by the connector's extended-command setting.
    pub fn for_connector(config: &ConnectorConfig) -> &'static Dispatcher {
        if config.extended_commands {
            Self::full()
        } else {
            Self::restricted()
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn resolve(&self, verb: &str) -> Option<Handler> {
        let upper = verb.trim().to_ascii_uppercase();
        self.table.get(upper.as_str()).copied()
    }
}
