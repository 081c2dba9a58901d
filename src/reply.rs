//! Building replies addressed to the original query.

use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::TXT;
use hickory_proto::rr::{Name, RData, Record};
use std::time::Duration;

/// Owner name of the diagnostic record naming the winning upstream
pub const PROVIDER_NAME: &str = "dns.provider.";

/// Link `response` to `request`: id, op code, flags and question section come
/// from the request. The upstream's response code and records are kept.
pub fn stamp_reply(response: &mut Message, request: &Message) {
    response.set_id(request.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(request.op_code());
    response.set_recursion_desired(request.recursion_desired());
    response.set_checking_disabled(request.checking_disabled());

    response.take_queries();
    for query in request.queries() {
        response.add_query(query.clone());
    }
}

/// A NOERROR reply with no records, addressed to `request`
pub fn empty_reply(request: &Message) -> Message {
    let mut response = Message::new();
    stamp_reply(&mut response, request);
    response.set_response_code(ResponseCode::NoError);
    response
}

/// Longest character-string a TXT record can carry on the wire
const MAX_TXT_STRING: usize = 255;

/// `dns.provider. 0 IN TXT "<net>://<address>" "rtt:<latency>"`
///
/// Labels longer than one character-string (long stamps, DOH URLs) are split
/// over consecutive strings; the rtt string is always last.
pub fn provider_record(upstream: &str, latency: Duration) -> Record {
    let name = Name::from_ascii(PROVIDER_NAME).unwrap_or_else(|_| Name::root());
    let mut strings = split_txt(upstream);
    strings.push(format!("rtt:{:?}", latency));
    Record::from_rdata(name, 0, RData::TXT(TXT::new(strings)))
}

/// Cut `s` into pieces of at most `MAX_TXT_STRING` bytes on char boundaries
fn split_txt(s: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut rest = s;
    while rest.len() > MAX_TXT_STRING {
        let mut cut = MAX_TXT_STRING;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        let (chunk, tail) = rest.split_at(cut);
        chunks.push(chunk.to_string());
        rest = tail;
    }
    chunks.push(rest.to_string());
    chunks
}

/// The upstream named by a provider record in `message`, if any
#[cfg(test)]
pub fn provider_of(message: &Message) -> Option<String> {
    message.answers().iter().find_map(|answer| {
        if answer.name().to_ascii() != PROVIDER_NAME {
            return None;
        }
        match answer.data() {
            RData::TXT(txt) => {
                let (_rtt, label) = txt.txt_data().split_last()?;
                Some(label.iter().map(|data| String::from_utf8_lossy(data)).collect())
            }
            _ => None,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::test_support::{answer_for, create_test_query};
    use hickory_proto::op::OpCode;

    #[test]
    fn test_empty_reply_is_addressed_to_request() {
        let mut request = create_test_query("example.com.");
        request.set_checking_disabled(true);

        let reply = empty_reply(&request);
        assert_eq!(reply.id(), request.id());
        assert_eq!(reply.message_type(), MessageType::Response);
        assert_eq!(reply.op_code(), OpCode::Query);
        assert!(reply.recursion_desired());
        assert!(reply.checking_disabled());
        assert_eq!(reply.response_code(), ResponseCode::NoError);
        assert_eq!(reply.queries(), request.queries());
        assert!(reply.answers().is_empty());
    }

    #[test]
    fn test_stamp_reply_keeps_answers_and_rcode() {
        let request = create_test_query("example.com.");
        let mut response = answer_for(&create_test_query("other.example."), [10, 0, 0, 1]);
        response.set_id(999);
        response.set_response_code(ResponseCode::NXDomain);

        stamp_reply(&mut response, &request);
        assert_eq!(response.id(), 1234);
        assert_eq!(response.response_code(), ResponseCode::NXDomain);
        assert_eq!(response.queries(), request.queries());
        assert_eq!(response.answers().len(), 1);
    }

    #[test]
    fn test_provider_record_round_trip() {
        let mut response = answer_for(&create_test_query("example.com."), [10, 0, 0, 1]);
        assert_eq!(provider_of(&response), None);

        response.add_answer(provider_record("udp://1.1.1.1:53", Duration::from_millis(12)));
        assert_eq!(provider_of(&response).as_deref(), Some("udp://1.1.1.1:53"));
        assert_eq!(response.answers().len(), 2);
    }

    #[test]
    fn test_long_provider_label_still_encodes() {
        let label = format!("sdns://{}", "A".repeat(600));
        let mut response = answer_for(&create_test_query("example.com."), [10, 0, 0, 1]);
        response.add_answer(provider_record(&label, Duration::from_millis(1)));

        assert!(response.to_vec().is_ok());
        assert_eq!(provider_of(&response), Some(label));
    }

    #[test]
    fn test_split_txt_respects_char_boundaries() {
        let label = "é".repeat(200);
        let chunks = split_txt(&label);

        assert!(chunks.iter().all(|chunk| chunk.len() <= MAX_TXT_STRING));
        assert_eq!(chunks.concat(), label);
        assert_eq!(split_txt("udp://1.1.1.1:53"), vec!["udp://1.1.1.1:53".to_string()]);
    }
}
