//! Command and response topics understood by the gateway middleware.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutClass {
    Short,
    Long,
}

/// One command channel: where the command goes, where replies may arrive,
/// and which key carries the verb.
#[derive(Debug, Clone, Copy)]
pub struct CommandSpec {
    pub request_topic: &'static str,
    pub response_topics: &'static [&'static str],
    pub verb_key: &'static str,
    pub timeout: TimeoutClass,
}

// Broker templates
pub const TEMPLATE_CREATED: &str = "broker-templates/create";
pub const TEMPLATE_UPDATED: &str = "broker-templates/update";
pub const TEMPLATE_DELETED: &str = "broker-templates/delete";

pub const TEMPLATES: CommandSpec = CommandSpec {
    request_topic: "broker-templates/requests",
    response_topics: &["broker-templates/response", "broker-templates/error"],
    verb_key: "action",
    timeout: TimeoutClass::Short,
};

// Static payloads
const PAYLOAD_COMMAND: &str = "command/data/payload";

pub const PAYLOAD_GET: CommandSpec = CommandSpec {
    request_topic: PAYLOAD_COMMAND,
    response_topics: &["response/data/payload"],
    verb_key: "command",
    timeout: TimeoutClass::Short,
};

pub const PAYLOAD_WRITE: CommandSpec = CommandSpec {
    request_topic: PAYLOAD_COMMAND,
    response_topics: &["response/data/write"],
    verb_key: "command",
    timeout: TimeoutClass::Short,
};

pub const PAYLOAD_UPDATE: CommandSpec = CommandSpec {
    request_topic: PAYLOAD_COMMAND,
    response_topics: &["response/data/update"],
    verb_key: "command",
    timeout: TimeoutClass::Short,
};

pub const PAYLOAD_DELETE: CommandSpec = CommandSpec {
    request_topic: PAYLOAD_COMMAND,
    response_topics: &["response/data/delete"],
    verb_key: "command",
    timeout: TimeoutClass::Short,
};

// Remapping
pub const REMAP: CommandSpec = CommandSpec {
    request_topic: "REMAP_COMMAND",
    response_topics: &["REMAP_RESPONSE"],
    verb_key: "command",
    timeout: TimeoutClass::Short,
};

// Device library
pub const LIBRARY_COMMAND: CommandSpec = CommandSpec {
    request_topic: "library/devices/command",
    response_topics: &["library/devices/command/response"],
    verb_key: "command",
    timeout: TimeoutClass::Long,
};

pub const LIBRARY_SUMMARY: CommandSpec = CommandSpec {
    request_topic: "library/devices/summary/search",
    response_topics: &["library/devices/summary/search/response"],
    verb_key: "command",
    timeout: TimeoutClass::Short,
};

// Visual automation
pub const AUTOMATION: CommandSpec = CommandSpec {
    request_topic: "automation/command",
    response_topics: &["automation/response"],
    verb_key: "command",
    timeout: TimeoutClass::Short,
};

// Node configuration
pub const NODE_INFO: CommandSpec = CommandSpec {
    request_topic: "node_info/command",
    response_topics: &["node_info/response"],
    verb_key: "command",
    timeout: TimeoutClass::Short,
};

// File transfer
pub const FILE_DOWNLOAD: CommandSpec = CommandSpec {
    request_topic: "command_download_file",
    response_topics: &["download_file_response"],
    verb_key: "command",
    timeout: TimeoutClass::Long,
};

pub const FILE_UPLOAD: CommandSpec = CommandSpec {
    request_topic: "command_upload_file",
    response_topics: &["response_file_transfer"],
    verb_key: "command",
    timeout: TimeoutClass::Long,
};

// Service control
pub const SERVICES: CommandSpec = CommandSpec {
    request_topic: "service/command",
    response_topics: &["service/response"],
    verb_key: "action",
    timeout: TimeoutClass::Short,
};
