use std::fmt;

use crate::error::{ElementError, Error, FailureKind, ProtocolError};

use super::Frame;

/// Slots taken by the header of every exchange frame: code, request id, step, iteration.
pub const HEADER_LEN: usize = 4;

/// Position of a trial in the analysis: time step and equilibrium iteration.
///
/// Ordered by step first, so every iteration of step `n` precedes step `n + 1`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Sequence {
    pub step: u64,
    pub iteration: u32,
}

impl Sequence {
    pub fn new(step: u64, iteration: u32) -> Self {
        Self { step, iteration }
    }

    /// Next iteration of the same step.
    pub fn next_iteration(self) -> Self {
        Self {
            step: self.step,
            iteration: self.iteration + 1,
        }
    }

    /// First iteration of the following step.
    pub fn next_step(self) -> Self {
        Self {
            step: self.step + 1,
            iteration: 0,
        }
    }

    fn encode(self) -> [f64; 2] {
        [self.step as f64, self.iteration as f64]
    }

    fn decode(step: f64, iteration: f64) -> Result<Self, ProtocolError> {
        let valid = |v: f64| v.is_finite() && v >= 0.0 && v.fract() == 0.0;
        if !valid(step) || !valid(iteration) || iteration > u32::MAX as f64 {
            return Err(ProtocolError::Unexpected(format!(
                "invalid sequence ({step}, {iteration})"
            )));
        }
        Ok(Self {
            step: step as u64,
            iteration: iteration as u32,
        })
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step {} iteration {}", self.step, self.iteration)
    }
}

/// Trial command values, one per trial control point.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialVector {
    pub sequence: Sequence,
    pub values: Vec<f64>,
}

impl TrialVector {
    pub fn new(sequence: Sequence, values: Vec<f64>) -> Self {
        Self { sequence, values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Measured values, one per daq control point, answering one trial.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseVector {
    pub sequence: Sequence,
    pub values: Vec<f64>,
}

impl ResponseVector {
    pub fn new(sequence: Sequence, values: Vec<f64>) -> Self {
        Self { sequence, values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Requests sent by the solver side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    SetTrial,
    GetDaqResponse,
    Commit,
    Revert,
    Die,
}

impl Action {
    pub fn code(self) -> f64 {
        match self {
            Action::SetTrial => 3.0,
            Action::GetDaqResponse => 5.0,
            Action::Commit => 6.0,
            Action::Revert => 7.0,
            Action::Die => 99.0,
        }
    }
}

impl TryFrom<f64> for Action {
    type Error = ProtocolError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        if value.fract() != 0.0 {
            return Err(ProtocolError::UnknownAction(value));
        }
        match value as i64 {
            3 => Ok(Action::SetTrial),
            5 => Ok(Action::GetDaqResponse),
            6 => Ok(Action::Commit),
            7 => Ok(Action::Revert),
            99 => Ok(Action::Die),
            _ => Err(ProtocolError::UnknownAction(value)),
        }
    }
}

/// Outcome reported by the site side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Completed,
    Failed,
    Received,
    /// Reply reconstructed without touching the backend; not authoritative.
    Approximate,
}

impl Status {
    pub fn code(self) -> f64 {
        match self {
            Status::Completed => 0.0,
            Status::Failed => -1.0,
            Status::Received => 4.0,
            Status::Approximate => 6.0,
        }
    }
}

impl TryFrom<f64> for Status {
    type Error = ProtocolError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        if value.fract() != 0.0 {
            return Err(ProtocolError::UnknownStatus(value));
        }
        match value as i64 {
            0 => Ok(Status::Completed),
            -1 => Ok(Status::Failed),
            4 => Ok(Status::Received),
            6 => Ok(Status::Approximate),
            _ => Err(ProtocolError::UnknownStatus(value)),
        }
    }
}

/// Decoded solver-side request.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Trial(TrialVector),
    GetDaqResponse(Sequence),
    Commit(Sequence),
    /// Return to the named commit, the last one the element knows of.
    Revert(Sequence),
    Die,
}

impl Message {
    pub fn action(&self) -> Action {
        match self {
            Message::Trial(_) => Action::SetTrial,
            Message::GetDaqResponse(_) => Action::GetDaqResponse,
            Message::Commit(_) => Action::Commit,
            Message::Revert(_) => Action::Revert,
            Message::Die => Action::Die,
        }
    }

    pub fn sequence(&self) -> Sequence {
        match self {
            Message::Trial(trial) => trial.sequence,
            Message::GetDaqResponse(sequence)
            | Message::Commit(sequence)
            | Message::Revert(sequence) => *sequence,
            Message::Die => Sequence::default(),
        }
    }
}

/// A [`Message`] with the session-unique id its reply must echo.
///
/// Ids grow by one per request and never repeat within a session; a retransmission
/// reuses the id of the request it repeats.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: u64,
    pub message: Message,
}

impl Request {
    pub fn new(id: u64, message: Message) -> Self {
        Self { id, message }
    }

    pub fn to_frame(&self, payload_size: usize) -> Result<Frame, ProtocolError> {
        let values: &[f64] = match &self.message {
            Message::Trial(trial) => &trial.values,
            _ => &[],
        };
        build_frame(
            self.message.action().code(),
            self.id,
            self.message.sequence(),
            values,
            payload_size,
        )
    }

    /// Decodes a request; trials carry `trial_size` values.
    pub fn from_frame(frame: &Frame, trial_size: usize) -> Result<Self, ProtocolError> {
        let header = split_frame(frame)?;
        let body = header.body;
        let message = match Action::try_from(header.code)? {
            Action::SetTrial => {
                if body.len() < trial_size {
                    return Err(ProtocolError::SizeMismatch {
                        expected: trial_size,
                        received: body.len(),
                    });
                }
                Message::Trial(TrialVector::new(header.sequence, body[..trial_size].to_vec()))
            }
            Action::GetDaqResponse => Message::GetDaqResponse(header.sequence),
            Action::Commit => Message::Commit(header.sequence),
            Action::Revert => Message::Revert(header.sequence),
            Action::Die => Message::Die,
        };
        Ok(Self::new(header.request, message))
    }

    /// Id carried by a frame that may not decode as a whole; 0 when unreadable.
    pub fn id_of(frame: &Frame) -> u64 {
        frame
            .values()
            .get(1)
            .and_then(|v| decode_counter(*v))
            .unwrap_or(0)
    }
}

/// Decoded site-side reply: `[status, request, step, iteration, values...]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub status: Status,
    /// Id of the request answered, 0 when the site could not read it.
    pub request: u64,
    pub sequence: Sequence,
    pub values: Vec<f64>,
}

impl Reply {
    pub fn response(request: u64, response: &ResponseVector, authoritative: bool) -> Self {
        Self {
            status: if authoritative {
                Status::Completed
            } else {
                Status::Approximate
            },
            request,
            sequence: response.sequence,
            values: response.values.clone(),
        }
    }

    pub fn ack(request: u64, status: Status, sequence: Sequence) -> Self {
        Self {
            status,
            request,
            sequence,
            values: Vec::new(),
        }
    }

    pub fn failed(request: u64, kind: FailureKind, sequence: Sequence) -> Self {
        Self {
            status: Status::Failed,
            request,
            sequence,
            values: vec![kind.code()],
        }
    }

    pub fn to_frame(&self, payload_size: usize) -> Result<Frame, ProtocolError> {
        build_frame(
            self.status.code(),
            self.request,
            self.sequence,
            &self.values,
            payload_size,
        )
    }

    /// Decodes a reply, keeping the first `value_count` body values.
    pub fn from_frame(frame: &Frame, value_count: usize) -> Result<Self, ProtocolError> {
        let header = split_frame(frame)?;
        let status = Status::try_from(header.code)?;
        let keep = match status {
            Status::Failed => 1,
            _ => value_count,
        };
        if header.body.len() < keep {
            return Err(ProtocolError::SizeMismatch {
                expected: keep,
                received: header.body.len(),
            });
        }
        Ok(Self {
            status,
            request: header.request,
            sequence: header.sequence,
            values: header.body[..keep].to_vec(),
        })
    }

    /// Maps a failed status onto the error it stands for.
    ///
    /// Values the site refused as non-finite surface as an [`ElementError`], every other
    /// failure as [`ProtocolError::SiteFailed`].
    pub fn into_result(self) -> Result<Self, Error> {
        if self.status != Status::Failed {
            return Ok(self);
        }
        let kind = FailureKind::from_code(self.values.first().copied().unwrap_or(0.0));
        Err(match kind {
            FailureKind::Element => ElementError::RejectedBySite {
                sequence: self.sequence,
            }
            .into(),
            kind => ProtocolError::SiteFailed {
                kind,
                sequence: self.sequence,
            }
            .into(),
        })
    }

    pub fn into_response(self) -> ResponseVector {
        ResponseVector::new(self.sequence, self.values)
    }
}

fn decode_counter(value: f64) -> Option<u64> {
    (value.is_finite() && value >= 0.0 && value.fract() == 0.0).then_some(value as u64)
}

fn build_frame(
    code: f64,
    request: u64,
    sequence: Sequence,
    values: &[f64],
    payload_size: usize,
) -> Result<Frame, ProtocolError> {
    let required = HEADER_LEN + values.len();
    if required > payload_size {
        return Err(ProtocolError::SizeMismatch {
            expected: payload_size,
            received: required,
        });
    }

    let mut frame = Frame::zeroed(payload_size);
    let slots = frame.values_mut();
    let [step, iteration] = sequence.encode();
    slots[0] = code;
    slots[1] = request as f64;
    slots[2] = step;
    slots[3] = iteration;
    slots[HEADER_LEN..required].copy_from_slice(values);
    Ok(frame)
}

struct Header<'a> {
    code: f64,
    request: u64,
    sequence: Sequence,
    body: &'a [f64],
}

fn split_frame(frame: &Frame) -> Result<Header<'_>, ProtocolError> {
    let values = frame.values();
    if values.len() < HEADER_LEN {
        return Err(ProtocolError::SizeMismatch {
            expected: HEADER_LEN,
            received: values.len(),
        });
    }
    let request = decode_counter(values[1]).ok_or_else(|| {
        ProtocolError::Unexpected(format!("invalid request id {}", values[1]))
    })?;
    Ok(Header {
        code: values[0],
        request,
        sequence: Sequence::decode(values[2], values[3])?,
        body: &values[HEADER_LEN..],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_ordering() {
        let a = Sequence::new(1, 5);
        assert!(a < a.next_iteration());
        assert!(a.next_iteration() < a.next_step());
        assert_eq!(a.next_step(), Sequence::new(2, 0));
    }

    #[test]
    fn trial_frame_layout() {
        let trial = TrialVector::new(Sequence::new(7, 2), vec![0.25, -1.0]);
        let request = Request::new(11, Message::Trial(trial));
        let frame = request.to_frame(8).unwrap();

        assert_eq!(frame.values(), &[3.0, 11.0, 7.0, 2.0, 0.25, -1.0, 0.0, 0.0]);
        assert_eq!(Request::from_frame(&frame, 2).unwrap(), request);
    }

    #[test]
    fn revert_names_the_commit_it_returns_to() {
        let request = Request::new(4, Message::Revert(Sequence::new(3, 1)));
        let frame = request.to_frame(6).unwrap();
        assert_eq!(&frame.values()[..4], &[7.0, 4.0, 3.0, 1.0]);
        assert_eq!(Request::from_frame(&frame, 1).unwrap(), request);
    }

    #[test]
    fn trial_larger_than_payload_is_refused() {
        let trial = TrialVector::new(Sequence::default(), vec![0.0; 5]);
        let res = Request::new(1, Message::Trial(trial)).to_frame(8);
        assert!(matches!(res, Err(ProtocolError::SizeMismatch { .. })));
    }

    #[test]
    fn unknown_action_is_protocol_error() {
        let frame = Frame::new(vec![42.0, 9.0, 0.0, 0.0]);
        assert!(matches!(
            Request::from_frame(&frame, 0),
            Err(ProtocolError::UnknownAction(code)) if code == 42.0
        ));
        assert_eq!(Request::id_of(&frame), 9);
        assert_eq!(Request::id_of(&Frame::new(vec![3.0, -2.0])), 0);
    }

    #[test]
    fn reply_echoes_request_id() {
        let response = ResponseVector::new(Sequence::new(2, 0), vec![1.5]);
        let frame = Reply::response(17, &response, true).to_frame(5).unwrap();
        let decoded = Reply::from_frame(&frame, 1).unwrap();
        assert_eq!(decoded.request, 17);
        assert_eq!(decoded.status, Status::Completed);
        assert_eq!(decoded.into_response(), response);
    }

    #[test]
    fn failed_reply_carries_kind() {
        let reply = Reply::failed(5, FailureKind::Backend, Sequence::new(3, 1));
        let frame = reply.to_frame(6).unwrap();
        let decoded = Reply::from_frame(&frame, 2).unwrap();
        assert_eq!(decoded.request, 5);

        match decoded.into_result() {
            Err(Error::Protocol(ProtocolError::SiteFailed { kind, sequence })) => {
                assert_eq!(kind, FailureKind::Backend);
                assert_eq!(sequence, Sequence::new(3, 1));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn element_failure_stays_an_element_error() {
        let reply = Reply::failed(5, FailureKind::Element, Sequence::new(3, 1));
        let decoded = Reply::from_frame(&reply.to_frame(6).unwrap(), 2).unwrap();
        assert!(matches!(
            decoded.into_result(),
            Err(Error::Element(ElementError::RejectedBySite { sequence }))
                if sequence == Sequence::new(3, 1)
        ));
    }

    #[test]
    fn approximate_reply_for_non_authoritative_response() {
        let response = ResponseVector::new(Sequence::new(1, 0), vec![2.0]);
        let reply = Reply::response(1, &response, false);
        assert_eq!(reply.status, Status::Approximate);
        assert_eq!(reply.into_response(), response);
    }

    #[test]
    fn negative_sequence_is_rejected() {
        let frame = Frame::new(vec![0.0, 1.0, -1.0, 0.0]);
        assert!(Reply::from_frame(&frame, 0).is_err());
    }
}
