use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::message_dto::{RosterDto, TaskEventDto};
use crate::api::JsonMap;
use crate::error::{Error, Result};

/// Every channel the manager speaks on, as a closed set. Dispatch matches on
/// this enum instead of raw channel strings, so an unhandled message kind is
/// a compile error rather than a silent drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    // Outbound, correlated.
    AuthRegister,
    AuthLogin,
    WorkflowSubmission,
    // Inbound, correlated replies.
    AuthRegisterResponse,
    AuthLoginResponse,
    WorkflowSubmissionResponse,
    // Inbound, unsolicited volunteer events.
    TaskAccept,
    TaskProgress,
    TaskStatus,
    TaskComplete,
    TaskFinish,
    // Inbound roster push.
    VolunteerAssignment,
    // Outbound completion broadcast.
    WorkflowFinish,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::AuthRegister => "auth/register",
            Channel::AuthLogin => "auth/login",
            Channel::WorkflowSubmission => "WORKFLOW_SUBMISSION",
            Channel::AuthRegisterResponse => "auth/register_response",
            Channel::AuthLoginResponse => "auth/login_response",
            Channel::WorkflowSubmissionResponse => "WORKFLOW_SUBMISSION_RESPONSE",
            Channel::TaskAccept => "task/accept",
            Channel::TaskProgress => "task/progress",
            Channel::TaskStatus => "task/status",
            Channel::TaskComplete => "task/complete",
            Channel::TaskFinish => "task/finish",
            Channel::VolunteerAssignment => "WORKFLOW_VOLUNTEER_ASSIGNMENT",
            Channel::WorkflowFinish => "workflow/finish",
        }
    }

    pub fn parse(s: &str) -> Option<Channel> {
        match s {
            "auth/register" => Some(Channel::AuthRegister),
            "auth/login" => Some(Channel::AuthLogin),
            "WORKFLOW_SUBMISSION" => Some(Channel::WorkflowSubmission),
            "auth/register_response" => Some(Channel::AuthRegisterResponse),
            "auth/login_response" => Some(Channel::AuthLoginResponse),
            "WORKFLOW_SUBMISSION_RESPONSE" => Some(Channel::WorkflowSubmissionResponse),
            "task/accept" => Some(Channel::TaskAccept),
            "task/progress" => Some(Channel::TaskProgress),
            "task/status" => Some(Channel::TaskStatus),
            "task/complete" => Some(Channel::TaskComplete),
            "task/finish" => Some(Channel::TaskFinish),
            "WORKFLOW_VOLUNTEER_ASSIGNMENT" => Some(Channel::VolunteerAssignment),
            "workflow/finish" => Some(Channel::WorkflowFinish),
            _ => None,
        }
    }

    /// The channel set the manager subscribes to.
    pub fn inbound() -> &'static [Channel] {
        &[
            Channel::AuthRegisterResponse,
            Channel::AuthLoginResponse,
            Channel::WorkflowSubmissionResponse,
            Channel::TaskAccept,
            Channel::TaskProgress,
            Channel::TaskStatus,
            Channel::TaskComplete,
            Channel::TaskFinish,
            Channel::VolunteerAssignment,
        ]
    }
}

/// The wire frame: a channel name plus a flat key-value body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub channel: String,
    pub data: JsonMap,
}

impl Envelope {
    pub fn new(channel: Channel, data: JsonMap) -> Self {
        Envelope { channel: channel.as_str().to_string(), data }
    }
}

/// Every inbound message kind, decoded and typed. The dispatcher matches
/// this exhaustively.
#[derive(Debug, Clone)]
pub enum Inbound {
    /// A correlated `*_response` body; routed to the request correlator.
    Reply { channel: Channel, body: JsonMap },
    TaskAccept(TaskEventDto),
    TaskProgress(TaskEventDto),
    TaskStatus(TaskEventDto),
    TaskComplete(TaskEventDto),
    TaskFail(TaskEventDto),
    Roster(RosterDto),
}

impl Inbound {
    /// Decodes an envelope into a typed inbound message.
    ///
    /// # Returns
    /// `Ok(None)` for channels that carry no inbound traffic (our own
    /// outbound channels looping back); `Error::Protocol` when a recognized
    /// channel carries a malformed body.
    pub fn decode(channel: Channel, data: JsonMap) -> Result<Option<Inbound>> {
        let event = |data: JsonMap| -> Result<TaskEventDto> {
            serde_json::from_value(Value::Object(data)).map_err(|e| Error::protocol(channel.as_str(), e))
        };

        let inbound = match channel {
            Channel::AuthRegisterResponse | Channel::AuthLoginResponse | Channel::WorkflowSubmissionResponse => {
                Inbound::Reply { channel, body: data }
            }
            Channel::TaskAccept => Inbound::TaskAccept(event(data)?),
            Channel::TaskProgress => Inbound::TaskProgress(event(data)?),
            Channel::TaskStatus => Inbound::TaskStatus(event(data)?),
            Channel::TaskComplete => Inbound::TaskComplete(event(data)?),
            Channel::TaskFinish => Inbound::TaskFail(event(data)?),
            Channel::VolunteerAssignment => {
                Inbound::Roster(serde_json::from_value(Value::Object(data)).map_err(|e| Error::protocol(channel.as_str(), e))?)
            }
            Channel::AuthRegister | Channel::AuthLogin | Channel::WorkflowSubmission | Channel::WorkflowFinish => return Ok(None),
        };
        Ok(Some(inbound))
    }
}
