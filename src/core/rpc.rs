use crate::core::kms::{guid_read, guid_write};
use crate::model::data::{Check, DataType, Message, U16, U32};
use crate::model::error::{Error, KmsError, KmsErrorKind, KmsResult};
use crate::model::rnd::random;
use num_enum::TryFromPrimitive;
use std::collections::HashMap;
use std::convert::TryFrom;
use std::io::{Cursor, Read};
use uuid::Uuid;

/// The activation interface negotiated during Bind
/// https://learn.microsoft.com/en-us/openspecs/windows_protocols/ms-kpp
pub const KMS_INTERFACE: Uuid = Uuid::from_u128(0x51c82175_844e_4750_b0d8_ec255555bc06);
pub const KMS_INTERFACE_VERSION: u32 = 0x0000_0001;

/// NDR 32 bit transfer syntax, the only one the host speaks
pub const NDR32_SYNTAX: Uuid = Uuid::from_u128(0x8a885d04_1ceb_11c9_9fe8_08002b104860);
pub const NDR32_VERSION: u32 = 0x0000_0002;

pub const PFC_FIRST_FRAG: u8 = 0x01;
pub const PFC_LAST_FRAG: u8 = 0x02;

pub const NCA_OP_RNG_ERROR: u32 = 0x1C01_0002;
pub const NCA_PROTO_ERROR: u32 = 0x1C01_000B;

/// Presentation context negotiation results
pub const RESULT_ACCEPTANCE: u16 = 0;
pub const RESULT_PROVIDER_REJECTION: u16 = 2;
pub const REASON_ABSTRACT_SYNTAX_NOT_SUPPORTED: u16 = 1;

pub const RPC_HEADER_SIZE: usize = 16;
/// Common header plus alloc hint, context id, cancel count and
/// its pad byte
const RESPONSE_HEADER_SIZE: usize = 24;
const DEFAULT_MAX_FRAG: u16 = 4280;

/// PDU types of the connection-oriented protocol, at offset 2
/// of the common header
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive)]
pub enum PduType {
    Request = 0x00,
    Response = 0x02,
    Fault = 0x03,
    Bind = 0x0B,
    BindAck = 0x0C,
}

/// The 16 byte common header shared by every PDU
#[derive(Debug, Clone, Copy)]
pub struct PduHeader {
    pub ptype: PduType,
    pub pfc_flags: u8,
    pub frag_length: u16,
    pub auth_length: u16,
    pub call_id: u32,
}

/// Decode and validate the common header
pub fn decode_header(raw: &[u8]) -> KmsResult<PduHeader> {
    let mut header = component![
        "rpcVersion" => Check::new(5_u8),
        "rpcVersionMinor" => Check::new(0_u8),
        "ptype" => 0_u8,
        "pfcFlags" => 0_u8,
        // little endian integers, ASCII, IEEE floats
        "integerRepresentation" => Check::new(0x10_u8),
        "representationReserved" => vec![0u8; 3],
        "fragLength" => U16::LE(0),
        "authLength" => U16::LE(0),
        "callId" => U32::LE(0)
    ];
    header.read(&mut Cursor::new(raw))?;
    Ok(PduHeader {
        ptype: PduType::try_from(cast!(DataType::U8, header["ptype"])?)?,
        pfc_flags: cast!(DataType::U8, header["pfcFlags"])?,
        frag_length: cast!(DataType::U16, header["fragLength"])?,
        auth_length: cast!(DataType::U16, header["authLength"])?,
        call_id: cast!(DataType::U32, header["callId"])?,
    })
}

/// Total size of the PDU whose common header starts the buffer,
/// driving incremental receive
pub fn pdu_size(raw: &[u8]) -> KmsResult<usize> {
    Ok(decode_header(raw)?.frag_length as usize)
}

fn header_message(ptype: PduType, pfc_flags: u8, frag_length: u16, call_id: u32) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(frag_length as usize);
    buffer.push(5);
    buffer.push(0);
    buffer.push(ptype as u8);
    buffer.push(pfc_flags);
    buffer.extend_from_slice(&[0x10, 0, 0, 0]);
    buffer.extend_from_slice(&frag_length.to_le_bytes());
    buffer.extend_from_slice(&0u16.to_le_bytes());
    buffer.extend_from_slice(&call_id.to_le_bytes());
    buffer
}

/// Outcome of feeding a Request PDU to the framer
#[derive(Debug, PartialEq, Eq)]
pub enum RequestEvent {
    /// More fragments of this call are expected
    Pending,
    /// A full activation blob was reassembled
    Complete { call_id: u32, payload: Vec<u8> },
}

/// Receive side of one RPC association
///
/// Owns the negotiated presentation context, the peer fragment
/// limit and the per call reassembly buffers.
pub struct RpcFramer {
    max_xmit_frag: u16,
    assoc_group: u32,
    accepted_context: Option<u16>,
    pending: HashMap<u32, Vec<u8>>,
}

impl Default for RpcFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcFramer {
    pub fn new() -> Self {
        RpcFramer {
            max_xmit_frag: DEFAULT_MAX_FRAG,
            assoc_group: 0,
            accepted_context: None,
            pending: HashMap::new(),
        }
    }

    /// Context id negotiated by the last Bind, if any
    pub fn accepted_context(&self) -> Option<u16> {
        self.accepted_context
    }

    /// Parse a Bind body and produce the matching BindAck
    pub fn handle_bind(&mut self, header: &PduHeader, body: &[u8]) -> KmsResult<Vec<u8>> {
        let mut reader = Cursor::new(body);
        let mut bind = component![
            "maxXmitFrag" => U16::LE(0),
            "maxRecvFrag" => U16::LE(0),
            "assocGroupId" => U32::LE(0),
            "numContextElements" => 0_u8,
            "reserved" => vec![0u8; 3]
        ];
        bind.read(&mut reader)?;

        let max_recv = cast!(DataType::U16, bind["maxRecvFrag"])?;
        if max_recv as usize > RESPONSE_HEADER_SIZE {
            self.max_xmit_frag = max_recv;
        }
        let incoming_group = cast!(DataType::U32, bind["assocGroupId"])?;
        self.assoc_group = if incoming_group != 0 {
            incoming_group
        } else {
            let mut fresh = [0u8; 4];
            fresh.copy_from_slice(&random(4));
            u32::from_le_bytes(fresh) | 1
        };

        let count = cast!(DataType::U8, bind["numContextElements"])?;
        let mut results: Vec<(u16, bool)> = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let mut element = component![
                "contextId" => U16::LE(0),
                "numTransferSyntaxes" => 0_u8,
                "reserved" => 0_u8,
                "abstractSyntax" => vec![0u8; 16],
                "abstractVersion" => U32::LE(0)
            ];
            element.read(&mut reader)?;
            let abstract_ok = guid_read(cast!(DataType::Slice, element["abstractSyntax"])?)?
                == KMS_INTERFACE
                && cast!(DataType::U32, element["abstractVersion"])? == KMS_INTERFACE_VERSION;

            let mut transfer_ok = false;
            for _ in 0..cast!(DataType::U8, element["numTransferSyntaxes"])? {
                let mut syntax = component![
                    "uuid" => vec![0u8; 16],
                    "version" => U32::LE(0)
                ];
                syntax.read(&mut reader)?;
                if guid_read(cast!(DataType::Slice, syntax["uuid"])?)? == NDR32_SYNTAX
                    && cast!(DataType::U32, syntax["version"])? == NDR32_VERSION
                {
                    transfer_ok = true;
                }
            }

            let context_id = cast!(DataType::U16, element["contextId"])?;
            let accepted = abstract_ok && transfer_ok;
            if accepted && self.accepted_context.is_none() {
                self.accepted_context = Some(context_id);
            }
            results.push((context_id, accepted));
        }

        self.build_bind_ack(header, cast!(DataType::U16, bind["maxXmitFrag"])?, max_recv, &results)
    }

    fn build_bind_ack(
        &self,
        header: &PduHeader,
        max_xmit: u16,
        max_recv: u16,
        results: &[(u16, bool)],
    ) -> KmsResult<Vec<u8>> {
        let sec_addr = b"135\0".to_vec();
        let pad = (4 - (2 + sec_addr.len()) % 4) % 4;
        let ack = component![
            "maxXmitFrag" => U16::LE(max_xmit),
            "maxRecvFrag" => U16::LE(max_recv),
            "assocGroupId" => U32::LE(self.assoc_group),
            "secAddrLength" => U16::LE(sec_addr.len() as u16),
            "secAddr" => sec_addr,
            "pad" => vec![0u8; pad],
            "numResults" => results.len() as u8,
            "reserved" => vec![0u8; 3]
        ];
        let mut body = Vec::with_capacity(ack.length() as usize + results.len() * 24);
        ack.write(&mut body)?;
        for (_, accepted) in results {
            let entry = if *accepted {
                component![
                    "result" => U16::LE(RESULT_ACCEPTANCE),
                    "reason" => U16::LE(0),
                    "transferSyntax" => guid_write(&NDR32_SYNTAX),
                    "syntaxVersion" => U32::LE(NDR32_VERSION)
                ]
            } else {
                component![
                    "result" => U16::LE(RESULT_PROVIDER_REJECTION),
                    "reason" => U16::LE(REASON_ABSTRACT_SYNTAX_NOT_SUPPORTED),
                    "transferSyntax" => vec![0u8; 16],
                    "syntaxVersion" => U32::LE(0)
                ]
            };
            entry.write(&mut body)?;
        }

        let frag_length = (RPC_HEADER_SIZE + body.len()) as u16;
        let mut pdu = header_message(
            PduType::BindAck,
            PFC_FIRST_FRAG | PFC_LAST_FRAG,
            frag_length,
            header.call_id,
        );
        pdu.extend_from_slice(&body);
        Ok(pdu)
    }

    /// Feed one Request PDU; fragments accumulate per call id
    /// until the last one arrives
    pub fn handle_request(&mut self, header: &PduHeader, body: &[u8]) -> KmsResult<RequestEvent> {
        let mut reader = Cursor::new(body);
        let mut request = component![
            "allocHint" => U32::LE(0),
            "contextId" => U16::LE(0),
            "opnum" => U16::LE(0)
        ];
        request.read(&mut reader)?;

        if header.pfc_flags & PFC_FIRST_FRAG != 0 {
            // the activation interface exposes a single operation
            if cast!(DataType::U16, request["opnum"])? != 0 {
                return Err(Error::KmsError(KmsError::new(
                    KmsErrorKind::UnknownOpnum,
                    "operation number out of range",
                )));
            }
            let context_id = cast!(DataType::U16, request["contextId"])?;
            if self.accepted_context != Some(context_id) {
                return Err(Error::KmsError(KmsError::new(
                    KmsErrorKind::InvalidData,
                    "request on an unnegotiated presentation context",
                )));
            }
        }

        let mut stub = Vec::new();
        reader.read_to_end(&mut stub)?;
        let buffer = self.pending.entry(header.call_id).or_default();
        buffer.extend_from_slice(&stub);

        if header.pfc_flags & PFC_LAST_FRAG == 0 {
            return Ok(RequestEvent::Pending);
        }
        let assembled = self.pending.remove(&header.call_id).unwrap_or_default();
        Ok(RequestEvent::Complete {
            call_id: header.call_id,
            payload: ndr_unwrap(&assembled)?,
        })
    }

    /// Emit a Response carrying the activation blob, fragmented
    /// at the peer limit when needed
    pub fn response(&self, call_id: u32, payload: &[u8]) -> KmsResult<Vec<u8>> {
        let stub = ndr_wrap(payload);
        let capacity = self.max_xmit_frag as usize - RESPONSE_HEADER_SIZE;
        let context_id = self.accepted_context.unwrap_or(0);

        let mut out = Vec::with_capacity(stub.len() + RESPONSE_HEADER_SIZE);
        let count = (stub.len() + capacity - 1) / capacity.max(1);
        for (index, chunk) in stub.chunks(capacity).enumerate() {
            let mut flags = 0;
            if index == 0 {
                flags |= PFC_FIRST_FRAG;
            }
            if index == count - 1 {
                flags |= PFC_LAST_FRAG;
            }
            let remaining = stub.len() - index * capacity;
            let frag_length = (RESPONSE_HEADER_SIZE + chunk.len()) as u16;
            let mut pdu = header_message(PduType::Response, flags, frag_length, call_id);
            let response = component![
                "allocHint" => U32::LE(remaining as u32),
                "contextId" => U16::LE(context_id),
                "cancelCount" => 0_u8,
                "reserved" => 0_u8
            ];
            response.write(&mut pdu)?;
            pdu.extend_from_slice(chunk);
            out.extend_from_slice(&pdu);
        }
        Ok(out)
    }

    /// Emit a Fault for a protocol level error, leaving the
    /// association open
    pub fn fault(&self, call_id: u32, status: u32) -> KmsResult<Vec<u8>> {
        let body = component![
            "allocHint" => U32::LE(32),
            "contextId" => U16::LE(self.accepted_context.unwrap_or(0)),
            "cancelCount" => 0_u8,
            "reserved" => 0_u8,
            "status" => U32::LE(status),
            "reserved2" => vec![0u8; 4]
        ];
        let mut pdu = header_message(
            PduType::Fault,
            PFC_FIRST_FRAG | PFC_LAST_FRAG,
            (RPC_HEADER_SIZE as u64 + body.length()) as u16,
            call_id,
        );
        body.write(&mut pdu)?;
        Ok(pdu)
    }
}

/// Wrap an activation blob as the NDR conformant byte array of
/// the single KMS operation
pub(crate) fn ndr_wrap(payload: &[u8]) -> Vec<u8> {
    let mut stub = Vec::with_capacity(payload.len() + 8);
    stub.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    stub.extend_from_slice(payload);
    while stub.len() % 4 != 0 {
        stub.push(0);
    }
    stub
}

fn ndr_unwrap(stub: &[u8]) -> KmsResult<Vec<u8>> {
    if stub.len() < 4 {
        return Err(Error::KmsError(KmsError::new(
            KmsErrorKind::ShortBuffer,
            "stub shorter than its array header",
        )));
    }
    let count = u32::from_le_bytes([stub[0], stub[1], stub[2], stub[3]]) as usize;
    if stub.len() < 4 + count {
        return Err(Error::KmsError(KmsError::new(
            KmsErrorKind::ShortBuffer,
            "conformant array exceeds the stub",
        )));
    }
    Ok(stub[4..4 + count].to_vec())
}

/// Build a client Bind PDU, the counterpart of `handle_bind`
/// exercised by the protocol tests
#[cfg(test)]
pub fn client_bind(call_id: u32, abstract_syntax: &Uuid) -> Vec<u8> {
    let body = component![
        "maxXmitFrag" => U16::LE(DEFAULT_MAX_FRAG),
        "maxRecvFrag" => U16::LE(DEFAULT_MAX_FRAG),
        "assocGroupId" => U32::LE(0),
        "numContextElements" => 1_u8,
        "reserved" => vec![0u8; 3],
        "contextId" => U16::LE(1),
        "numTransferSyntaxes" => 1_u8,
        "reserved2" => 0_u8,
        "abstractSyntax" => guid_write(abstract_syntax),
        "abstractVersion" => U32::LE(KMS_INTERFACE_VERSION),
        "transferSyntax" => guid_write(&NDR32_SYNTAX),
        "transferVersion" => U32::LE(NDR32_VERSION)
    ];
    let mut pdu = header_message(
        PduType::Bind,
        PFC_FIRST_FRAG | PFC_LAST_FRAG,
        (RPC_HEADER_SIZE as u64 + body.length()) as u16,
        call_id,
    );
    body.write(&mut pdu).unwrap();
    pdu
}

/// Build a client Request PDU around an already wrapped stub
#[cfg(test)]
pub fn client_request(call_id: u32, pfc_flags: u8, context_id: u16, stub: &[u8]) -> Vec<u8> {
    let body = component![
        "allocHint" => U32::LE(stub.len() as u32),
        "contextId" => U16::LE(context_id),
        "opnum" => U16::LE(0)
    ];
    let mut pdu = header_message(
        PduType::Request,
        pfc_flags,
        (RPC_HEADER_SIZE as u64 + body.length() + stub.len() as u64) as u16,
        call_id,
    );
    body.write(&mut pdu).unwrap();
    pdu.extend_from_slice(stub);
    pdu
}
