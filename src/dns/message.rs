use super::{DnsError, DnsName, DnsQuestion, DnsRecord, RecordType};
use std::fmt;
use std::ops::Range;

pub const HEADER_LEN: usize = 12;

mod field {
    pub const ID: usize = 0;
    pub const FLAGS_HI: usize = 2;
    pub const FLAGS_LO: usize = 3;
    pub const QD_COUNT: usize = 4;
    pub const AN_COUNT: usize = 6;
    pub const NS_COUNT: usize = 8;
    pub const AR_COUNT: usize = 10;
}

const QR: u8 = 0x80;
const AA: u8 = 0x04;
const TC: u8 = 0x02;
const RD: u8 = 0x01;
const RA: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseCode {
    NoError,
    FormatError,
    ServerFailure,
    NameError,
    NotImplemented,
    Refused,
    YxDomain,
    YxRrSet,
    NxRrSet,
    NotAuth,
    NotZone,
    Other(u8),
}

impl From<u8> for ResponseCode {
    fn from(value: u8) -> Self {
        match value & 0x0F {
            0 => ResponseCode::NoError,
            1 => ResponseCode::FormatError,
            2 => ResponseCode::ServerFailure,
            3 => ResponseCode::NameError,
            4 => ResponseCode::NotImplemented,
            5 => ResponseCode::Refused,
            6 => ResponseCode::YxDomain,
            7 => ResponseCode::YxRrSet,
            8 => ResponseCode::NxRrSet,
            9 => ResponseCode::NotAuth,
            10 => ResponseCode::NotZone,
            other => ResponseCode::Other(other),
        }
    }
}

impl From<ResponseCode> for u8 {
    fn from(value: ResponseCode) -> Self {
        match value {
            ResponseCode::NoError => 0,
            ResponseCode::FormatError => 1,
            ResponseCode::ServerFailure => 2,
            ResponseCode::NameError => 3,
            ResponseCode::NotImplemented => 4,
            ResponseCode::Refused => 5,
            ResponseCode::YxDomain => 6,
            ResponseCode::YxRrSet => 7,
            ResponseCode::NxRrSet => 8,
            ResponseCode::NotAuth => 9,
            ResponseCode::NotZone => 10,
            ResponseCode::Other(other) => other & 0x0F,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Query,
    InverseQuery,
    Status,
    Notify,
    Update,
    Other(u8),
}

impl From<u8> for OpCode {
    fn from(value: u8) -> Self {
        match value & 0x0F {
            0 => OpCode::Query,
            1 => OpCode::InverseQuery,
            2 => OpCode::Status,
            4 => OpCode::Notify,
            5 => OpCode::Update,
            other => OpCode::Other(other),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(value: OpCode) -> Self {
        match value {
            OpCode::Query => 0,
            OpCode::InverseQuery => 1,
            OpCode::Status => 2,
            OpCode::Notify => 4,
            OpCode::Update => 5,
            OpCode::Other(other) => other & 0x0F,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Question,
    Answer,
    Authority,
    Additional,
}

impl Section {
    fn count_offset(self) -> usize {
        match self {
            Section::Question => field::QD_COUNT,
            Section::Answer => field::AN_COUNT,
            Section::Authority => field::NS_COUNT,
            Section::Additional => field::AR_COUNT,
        }
    }
}

/// Byte ranges of the four sections, found by walking the message.
#[derive(Debug, Clone)]
struct Layout {
    questions: Range<usize>,
    answers: Range<usize>,
    authorities: Range<usize>,
    additionals: Range<usize>,
}

impl Layout {
    fn range(&self, section: Section) -> Range<usize> {
        match section {
            Section::Question => self.questions.clone(),
            Section::Answer => self.answers.clone(),
            Section::Authority => self.authorities.clone(),
            Section::Additional => self.additionals.clone(),
        }
    }
}

/// A DNS message backed by its wire bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct DnsMessage {
    buffer: Vec<u8>,
}

impl Default for DnsMessage {
    fn default() -> Self {
        Self {
            buffer: vec![0u8; HEADER_LEN],
        }
    }
}

impl DnsMessage {
    /// Wraps a received payload after checking that every counted question
    /// and record is present.
    pub fn parse(buffer: Vec<u8>) -> Result<Self, DnsError> {
        if buffer.len() < HEADER_LEN {
            return Err(DnsError::Truncated);
        }
        let message = Self { buffer };
        message.layout()?;
        Ok(message)
    }

    /// Standard recursive query for a single name.
    pub fn query(id: u16, name: &str, record_type: RecordType) -> Result<Self, DnsError> {
        let mut message = Self::default();
        message.set_id(id);
        message.set_recursion_desired(true);
        message.set_questions(&[DnsQuestion::new(name, record_type)?])?;
        Ok(message)
    }

    /// Authoritative response to `query` carrying the given sections. Copies
    /// the id and recursion-desired bit.
    pub fn reply_to_query(
        query: &DnsMessage,
        questions: &[DnsQuestion],
        answers: &[DnsRecord],
    ) -> Result<Self, DnsError> {
        let mut reply = Self::default();
        reply.set_id(query.id());
        reply.set_response(true);
        reply.set_opcode(OpCode::Query);
        reply.set_authoritative(true);
        reply.set_recursion_desired(query.recursion_desired());
        reply.set_questions(questions)?;
        reply.set_answers(answers)?;
        Ok(reply)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    fn read_u16(&self, offset: usize) -> u16 {
        u16::from_be_bytes([self.buffer[offset], self.buffer[offset + 1]])
    }

    fn write_u16(&mut self, offset: usize, value: u16) {
        self.buffer[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
    }

    fn set_bit(&mut self, offset: usize, mask: u8, value: bool) {
        if value {
            self.buffer[offset] |= mask;
        } else {
            self.buffer[offset] &= !mask;
        }
    }

    pub fn id(&self) -> u16 {
        self.read_u16(field::ID)
    }

    pub fn set_id(&mut self, id: u16) {
        self.write_u16(field::ID, id);
    }

    pub fn is_response(&self) -> bool {
        self.buffer[field::FLAGS_HI] & QR != 0
    }

    pub fn set_response(&mut self, value: bool) {
        self.set_bit(field::FLAGS_HI, QR, value);
    }

    pub fn opcode(&self) -> OpCode {
        OpCode::from((self.buffer[field::FLAGS_HI] >> 3) & 0x0F)
    }

    pub fn set_opcode(&mut self, opcode: OpCode) {
        let byte = &mut self.buffer[field::FLAGS_HI];
        *byte = (*byte & 0x87) | ((u8::from(opcode) & 0x0F) << 3);
    }

    pub fn authoritative(&self) -> bool {
        self.buffer[field::FLAGS_HI] & AA != 0
    }

    pub fn set_authoritative(&mut self, value: bool) {
        self.set_bit(field::FLAGS_HI, AA, value);
    }

    pub fn truncated(&self) -> bool {
        self.buffer[field::FLAGS_HI] & TC != 0
    }

    pub fn set_truncated(&mut self, value: bool) {
        self.set_bit(field::FLAGS_HI, TC, value);
    }

    pub fn recursion_desired(&self) -> bool {
        self.buffer[field::FLAGS_HI] & RD != 0
    }

    pub fn set_recursion_desired(&mut self, value: bool) {
        self.set_bit(field::FLAGS_HI, RD, value);
    }

    pub fn recursion_available(&self) -> bool {
        self.buffer[field::FLAGS_LO] & RA != 0
    }

    pub fn set_recursion_available(&mut self, value: bool) {
        self.set_bit(field::FLAGS_LO, RA, value);
    }

    pub fn response_code(&self) -> ResponseCode {
        ResponseCode::from(self.buffer[field::FLAGS_LO] & 0x0F)
    }

    pub fn set_response_code(&mut self, code: ResponseCode) {
        let byte = &mut self.buffer[field::FLAGS_LO];
        *byte = (*byte & 0xF0) | u8::from(code);
    }

    pub fn question_count(&self) -> u16 {
        self.read_u16(field::QD_COUNT)
    }

    pub fn answer_count(&self) -> u16 {
        self.read_u16(field::AN_COUNT)
    }

    pub fn authority_count(&self) -> u16 {
        self.read_u16(field::NS_COUNT)
    }

    pub fn additional_count(&self) -> u16 {
        self.read_u16(field::AR_COUNT)
    }

    fn layout(&self) -> Result<Layout, DnsError> {
        let mut offset = HEADER_LEN;
        let start = offset;
        for _ in 0..self.question_count() {
            offset += DnsQuestion::parse(&self.buffer, offset)?.encoded_len();
        }
        let questions = start..offset;
        let answers = self.walk_records(&mut offset, self.answer_count())?;
        let authorities = self.walk_records(&mut offset, self.authority_count())?;
        let additionals = self.walk_records(&mut offset, self.additional_count())?;
        Ok(Layout {
            questions,
            answers,
            authorities,
            additionals,
        })
    }

    fn walk_records(&self, offset: &mut usize, count: u16) -> Result<Range<usize>, DnsError> {
        let start = *offset;
        for _ in 0..count {
            *offset += DnsRecord::parse(&self.buffer, *offset)?.encoded_len();
        }
        Ok(start..*offset)
    }

    pub fn questions(&self) -> Result<Vec<DnsQuestion>, DnsError> {
        let mut offset = HEADER_LEN;
        let mut questions = Vec::with_capacity(usize::from(self.question_count()));
        for _ in 0..self.question_count() {
            let question = DnsQuestion::parse(&self.buffer, offset)?;
            offset += question.encoded_len();
            questions.push(question);
        }
        Ok(questions)
    }

    pub fn answers(&self) -> Result<Vec<DnsRecord>, DnsError> {
        self.records(Section::Answer)
    }

    pub fn authorities(&self) -> Result<Vec<DnsRecord>, DnsError> {
        self.records(Section::Authority)
    }

    pub fn additionals(&self) -> Result<Vec<DnsRecord>, DnsError> {
        self.records(Section::Additional)
    }

    fn records(&self, section: Section) -> Result<Vec<DnsRecord>, DnsError> {
        let range = self.layout()?.range(section);
        let mut offset = range.start;
        let mut records = Vec::new();
        while offset < range.end {
            let record = DnsRecord::parse(&self.buffer, offset)?;
            offset += record.encoded_len();
            records.push(record);
        }
        Ok(records)
    }

    pub fn set_questions(&mut self, questions: &[DnsQuestion]) -> Result<(), DnsError> {
        let mut bytes = Vec::new();
        for question in questions {
            question.encode_into(&mut bytes);
        }
        self.splice(Section::Question, questions.len(), bytes)
    }

    pub fn set_answers(&mut self, records: &[DnsRecord]) -> Result<(), DnsError> {
        self.set_records(Section::Answer, records)
    }

    pub fn set_authorities(&mut self, records: &[DnsRecord]) -> Result<(), DnsError> {
        self.set_records(Section::Authority, records)
    }

    pub fn set_additionals(&mut self, records: &[DnsRecord]) -> Result<(), DnsError> {
        self.set_records(Section::Additional, records)
    }

    fn set_records(&mut self, section: Section, records: &[DnsRecord]) -> Result<(), DnsError> {
        let mut bytes = Vec::new();
        for record in records {
            record.encode_into(&mut bytes);
        }
        self.splice(section, records.len(), bytes)
    }

    /// Replaces one section's bytes in place and rewrites its count.
    fn splice(&mut self, section: Section, count: usize, bytes: Vec<u8>) -> Result<(), DnsError> {
        let count = u16::try_from(count).map_err(|_| DnsError::SectionOverflow(count))?;
        let range = self.layout()?.range(section);
        self.buffer.splice(range, bytes);
        self.write_u16(section.count_offset(), count);
        Ok(())
    }

    /// First question name, used for logging.
    pub fn first_name(&self) -> Option<DnsName> {
        DnsQuestion::parse(&self.buffer, HEADER_LEN)
            .ok()
            .filter(|_| self.question_count() > 0)
            .map(|question| question.name)
    }
}

impl fmt::Display for DnsMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DNS id={} {} {:?} rcode={:?} qd={} an={} ns={} ar={}",
            self.id(),
            if self.is_response() { "response" } else { "query" },
            self.opcode(),
            self.response_code(),
            self.question_count(),
            self.answer_count(),
            self.authority_count(),
            self.additional_count()
        )
    }
}

impl fmt::Debug for DnsMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
