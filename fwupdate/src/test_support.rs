// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Scripted TPM transport and wire builders shared by the unit tests.

use crate::codec::Writer;
use crate::fieldupgrade::FieldUpgradeInfo;
use crate::tpm12proto;
use crate::tpm_device::TpmIoError;
use crate::tpm_device::TpmTransport;
use std::collections::VecDeque;
use std::time::Duration;

/// Answers each transmit with the next scripted response and records every
/// command sent.
pub struct ScriptedTransport {
    pub commands: Vec<Vec<u8>>,
    pub responses: VecDeque<Vec<u8>>,
}

impl ScriptedTransport {
    pub fn new(responses: Vec<Vec<u8>>) -> Self {
        Self {
            commands: Vec::new(),
            responses: responses.into(),
        }
    }

    pub fn push_response(&mut self, response: Vec<u8>) {
        self.responses.push_back(response);
    }

    /// Command codes / ordinals seen so far, for asserting sequencing.
    pub fn sent_codes(&self) -> Vec<u32> {
        self.commands
            .iter()
            .map(|cmd| u32::from_be_bytes(cmd[6..10].try_into().unwrap()))
            .collect()
    }
}

impl TpmTransport for ScriptedTransport {
    fn transmit(
        &mut self,
        command: &[u8],
        _max_duration: Duration,
    ) -> Result<Vec<u8>, TpmIoError> {
        self.commands.push(command.to_vec());
        Ok(self
            .responses
            .pop_front()
            .unwrap_or_else(|| panic!("unscripted command #{}", self.commands.len())))
    }
}

/// A 1.2-format reply: tag, size, result, body.
pub fn reply_12(result: u32, body: &[u8]) -> Vec<u8> {
    let mut reply = Vec::new();
    reply.extend_from_slice(&tpm12proto::TPM_TAG_RSP_COMMAND.to_be_bytes());
    reply.extend_from_slice(&(10 + body.len() as u32).to_be_bytes());
    reply.extend_from_slice(&result.to_be_bytes());
    reply.extend_from_slice(body);
    reply
}

/// A 1.2-format AUTH1 reply with a zeroed response auth trailer.
pub fn reply_12_auth(result: u32, body: &[u8]) -> Vec<u8> {
    let mut full = body.to_vec();
    full.extend_from_slice(&[0u8; 41]);
    let mut reply = reply_12(result, &full);
    reply[..2].copy_from_slice(&tpm12proto::TPM_TAG_RSP_AUTH1_COMMAND.to_be_bytes());
    reply
}

/// A 2.0-format reply. A failing reply carries the NoSessions tag as the
/// response validation demands.
pub fn reply_20(session_tag: u16, response_code: u32, body: &[u8]) -> Vec<u8> {
    let tag = if response_code == 0 { session_tag } else { 0x8001 };
    let mut reply = Vec::new();
    reply.extend_from_slice(&tag.to_be_bytes());
    reply.extend_from_slice(&(10 + body.len() as u32).to_be_bytes());
    reply.extend_from_slice(&response_code.to_be_bytes());
    reply.extend_from_slice(body);
    // Fixed-layout replies are read with `read_from_prefix`; keep the buffer
    // at least as large as the biggest fixed reply.
    if reply.len() < 32 {
        reply.resize(32, 0);
    }
    reply
}

pub fn info_bytes(info: &FieldUpgradeInfo) -> Vec<u8> {
    let mut buf = [0u8; 512];
    let mut writer = Writer::new(&mut buf);
    info.marshal(&mut writer).unwrap();
    let len = writer.len();
    buf[..len].to_vec()
}

/// A 2.0 GetCapability reply carrying the vendor info blob.
pub fn vendor_cap_reply(info: &FieldUpgradeInfo) -> Vec<u8> {
    let blob = info_bytes(info);
    let mut body = Vec::new();
    body.push(0); // moreData
    body.extend_from_slice(&crate::tpm20proto::TPM_CAP_VENDOR_PROPERTY.to_be_bytes());
    body.extend_from_slice(&(blob.len() as u16).to_be_bytes());
    body.extend_from_slice(&blob);
    reply_20(0x8001, 0, &body)
}

/// A 2.0 GetCapability reply with tagged properties.
pub fn props_cap_reply(props: &[(u32, u32)]) -> Vec<u8> {
    let mut body = Vec::new();
    body.push(0); // moreData
    body.extend_from_slice(&crate::tpm20proto::TPM_CAP_TPM_PROPERTIES.to_be_bytes());
    body.extend_from_slice(&(props.len() as u32).to_be_bytes());
    for (property, value) in props {
        body.extend_from_slice(&property.to_be_bytes());
        body.extend_from_slice(&value.to_be_bytes());
    }
    reply_20(0x8001, 0, &body)
}

/// A 2.0 StartAuthSession success reply.
pub fn start_session_reply(handle: u32) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&handle.to_be_bytes());
    body.extend_from_slice(&16u16.to_be_bytes());
    body.extend_from_slice(&[0x33; 16]);
    reply_20(0x8001, 0, &body)
}
