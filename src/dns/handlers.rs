use crate::error::Error;
use crate::store::SharedStore;
use crate::zone::{SharedZone, StaticAnswer};
use std::time::Duration;
use tracing::error;
use trust_dns_proto::op::Edns;
use trust_dns_proto::serialize::binary::BinEncodable;
use trust_dns_server::authority::MessageResponseBuilder;
use trust_dns_server::client::op::{Header, MessageType, OpCode, ResponseCode};
use trust_dns_server::client::rr::rdata::TXT;
use trust_dns_server::client::rr::{DNSClass, LowerName, Name, RData, Record, RecordType};
use trust_dns_server::server::{
    Protocol, Request, RequestHandler, ResponseHandler, ResponseInfo,
};

const TXT_TTL: u32 = 1;
const HEADER_LEN: usize = 12;
const OPT_LEN: usize = 11;
const MIN_UDP_PAYLOAD: u16 = 512;
const EDNS_MAX_PAYLOAD: u16 = 1232;

#[derive(Clone)]
pub struct Handler {
    zone: SharedZone,
    store: SharedStore,
    query_timeout: Duration,
}

/// A resolved question, before it is fitted to the transport and encoded.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Answer {
    pub code: ResponseCode,
    pub answers: Vec<Record>,
    pub authority: Vec<Record>,
}

impl Answer {
    fn code(code: ResponseCode) -> Self {
        Answer {
            code,
            answers: Vec::new(),
            authority: Vec::new(),
        }
    }

    fn records(answers: Vec<Record>) -> Self {
        Answer {
            code: ResponseCode::NoError,
            answers,
            authority: Vec::new(),
        }
    }
}

impl Handler {
    pub(crate) fn new(zone: SharedZone, store: SharedStore, query_timeout: Duration) -> Self {
        Handler {
            zone,
            store,
            query_timeout,
        }
    }

    async fn dispatch_request<R: ResponseHandler>(
        &self,
        request: &Request,
        response: R,
    ) -> Result<ResponseInfo, Error> {
        // If it isn't a query, return NOTIMPL.
        if request.op_code() != OpCode::Query || request.message_type() != MessageType::Query {
            return self
                .send_error(request, response, ResponseCode::NotImp)
                .await;
        }

        let query = request.query();
        let answer = self
            .resolve(query.name(), query.query_type(), query.query_class())
            .await;
        tracing::debug!(
            "{} {} {} -> {}",
            request.src(),
            query.query_type(),
            query.name(),
            answer.code
        );
        self.send_answer(request, response, answer).await
    }

    /// Answer one question from the static zone or the record store.
    pub(crate) async fn resolve(
        &self,
        name: &LowerName,
        query_type: RecordType,
        query_class: DNSClass,
    ) -> Answer {
        if query_class != DNSClass::IN || !self.zone.contains(name) {
            return Answer::code(ResponseCode::Refused);
        }

        match self.zone.static_answers(name, query_type) {
            StaticAnswer::Records(records) => Answer::records(records),
            StaticAnswer::NoData => self.negative(ResponseCode::NoError),
            StaticAnswer::NotStatic => self.resolve_dynamic(name, query_type).await,
        }
    }

    async fn resolve_dynamic(&self, name: &LowerName, query_type: RecordType) -> Answer {
        let Some(label) = self.zone.dynamic_label(name) else {
            return self.negative(ResponseCode::NXDomain);
        };

        let lookup = self.store.lookup_challenge_values(&label);
        match tokio::time::timeout(self.query_timeout, lookup).await {
            Err(_) => {
                error!("TXT lookup for \"{name}\" timed out");
                Answer::code(ResponseCode::ServFail)
            }
            Ok(None) => self.negative(ResponseCode::NXDomain),
            Ok(Some(values)) if matches!(query_type, RecordType::TXT | RecordType::ANY) => {
                Answer::records(self.txt_records(name, values))
            }
            Ok(Some(_)) => self.negative(ResponseCode::NoError),
        }
    }

    fn txt_records(&self, name: &LowerName, values: Vec<String>) -> Vec<Record> {
        values
            .into_iter()
            .map(|v| Record::from_rdata(name.into(), TXT_TTL, RData::TXT(TXT::new(vec![v]))))
            .collect()
    }

    /// NXDOMAIN or NODATA, with the apex SOA for negative caching.
    fn negative(&self, code: ResponseCode) -> Answer {
        Answer {
            code,
            answers: Vec::new(),
            authority: vec![self.zone.soa()],
        }
    }

    async fn send_error<R: ResponseHandler>(
        &self,
        request: &Request,
        mut response_handle: R,
        code: ResponseCode,
    ) -> Result<ResponseInfo, Error> {
        let response = MessageResponseBuilder::from_message_request(request);
        Ok(response_handle
            .send_response(response.error_msg(request.header(), code))
            .await?)
    }

    async fn send_answer<R: ResponseHandler>(
        &self,
        request: &Request,
        mut response_handle: R,
        answer: Answer,
    ) -> Result<ResponseInfo, Error> {
        let edns = response_edns(request);
        let question_len = Name::from(request.query().name())
            .to_bytes()
            .map_or(0, |b| b.len() + 4);
        let overhead = HEADER_LEN + question_len + edns.as_ref().map_or(0, |_| OPT_LEN);
        let mut budget = payload_budget(request).saturating_sub(overhead);

        let (answers, truncated) = take_fitting(answer.answers, &mut budget);
        let authority = if truncated {
            Vec::new()
        } else {
            take_fitting(answer.authority, &mut budget).0
        };

        let mut header = Header::response_from_request(request.header());
        header.set_authoritative(true);
        header.set_recursion_available(false);
        header.set_truncated(truncated);
        header.set_response_code(answer.code);

        let mut builder = MessageResponseBuilder::from_message_request(request);
        if let Some(edns) = edns {
            builder.edns(edns);
        }
        let response = builder.build(header, answers.iter(), &[], authority.iter(), &[]);
        Ok(response_handle.send_response(response).await?)
    }
}

/// The largest response the client can take: 512 bytes over UDP unless it advertised a larger
/// EDNS0 buffer, unbounded over stream transports.
fn payload_budget(request: &Request) -> usize {
    match request.protocol() {
        Protocol::Udp => usize::from(
            request
                .edns()
                .map_or(MIN_UDP_PAYLOAD, |edns| edns.max_payload().max(MIN_UDP_PAYLOAD)),
        ),
        _ => usize::from(u16::MAX),
    }
}

fn response_edns(request: &Request) -> Option<Edns> {
    request.edns().map(|_| {
        let mut edns = Edns::new();
        edns.set_max_payload(EDNS_MAX_PAYLOAD);
        edns.set_version(0);
        edns
    })
}

/// Keep leading records while their (uncompressed) encoding fits in `budget`.
///
/// Returns the kept records and whether any had to be dropped.
fn take_fitting(records: Vec<Record>, budget: &mut usize) -> (Vec<Record>, bool) {
    let mut kept = Vec::with_capacity(records.len());
    for record in records {
        let len = record.to_bytes().map_or(usize::MAX, |b| b.len());
        if len > *budget {
            return (kept, true);
        }
        *budget -= len;
        kept.push(record);
    }
    (kept, false)
}

#[async_trait::async_trait]
impl RequestHandler for Handler {
    async fn handle_request<R: ResponseHandler>(
        &self,
        request: &Request,
        response_handle: R,
    ) -> ResponseInfo {
        match self.dispatch_request(request, response_handle).await {
            Ok(info) => info,
            Err(error) => {
                error!("error in RequestHandler: {:?}", error);
                let mut header = Header::new();
                header.set_response_code(ResponseCode::ServFail);
                header.into()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::EXAMPLE;
    use crate::config::{Config, BCRYPT_MIN_COST};
    use crate::store::tests::{test_store, SlowBackend};
    use crate::store::{RecordStore, ACME_CHALLENGE_LABEL};
    use crate::zone::Zone;
    use std::io;
    use std::str::FromStr;
    use std::sync::{Arc, Mutex};
    use std::time::Instant;
    use trust_dns_proto::op::{Message, Query};
    use trust_dns_proto::serialize::binary::{BinDecodable, BinEncoder};
    use trust_dns_server::authority::{MessageRequest, MessageResponse};

    /// Captures the encoded response instead of sending it.
    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    #[async_trait::async_trait]
    impl ResponseHandler for Capture {
        async fn send_response<'a>(
            &mut self,
            response: MessageResponse<
                '_,
                'a,
                impl Iterator<Item = &'a Record> + Send + 'a,
                impl Iterator<Item = &'a Record> + Send + 'a,
                impl Iterator<Item = &'a Record> + Send + 'a,
                impl Iterator<Item = &'a Record> + Send + 'a,
            >,
        ) -> io::Result<ResponseInfo> {
            let mut buf = Vec::with_capacity(512);
            let info = {
                let mut encoder = BinEncoder::new(&mut buf);
                response
                    .destructive_emit(&mut encoder)
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
            };
            *self.0.lock().unwrap() = buf;
            Ok(info)
        }
    }

    async fn handler_with(records: &[&str]) -> Handler {
        let mut config = Config::try_from_json(EXAMPLE).unwrap();
        config.records = records.iter().map(|s| s.to_string()).collect();
        let zone = Arc::new(Zone::try_from_config(&config).unwrap());
        let store = Arc::new(test_store().await);
        store.reserve(ACME_CHALLENGE_LABEL).await.unwrap();
        Handler::new(zone, store, Duration::from_secs(2))
    }

    fn query_message(name: &str, query_type: RecordType) -> Message {
        let mut message = Message::new();
        message
            .set_id(4242)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true)
            .add_query(Query::query(Name::from_str(name).unwrap(), query_type));
        message
    }

    async fn exchange_bytes(handler: &Handler, bytes: &[u8], protocol: Protocol) -> Message {
        let request = Request::new(
            MessageRequest::from_bytes(bytes).unwrap(),
            "192.0.2.53:53000".parse().unwrap(),
            protocol,
        );
        let capture = Capture::default();
        handler.handle_request(&request, capture.clone()).await;
        let bytes = capture.0.lock().unwrap().clone();
        Message::from_vec(&bytes).unwrap()
    }

    async fn exchange(handler: &Handler, message: &Message) -> Message {
        exchange_bytes(handler, &message.to_vec().unwrap(), Protocol::Udp).await
    }

    fn txt_values(message: &Message) -> Vec<String> {
        message
            .answers()
            .iter()
            .filter_map(|r| match r.data() {
                Some(RData::TXT(txt)) => Some(txt.to_string()),
                _ => None,
            })
            .collect()
    }

    fn digest(c: char) -> String {
        std::iter::repeat(c).take(43).collect()
    }

    #[tokio::test]
    async fn unknown_label_is_nxdomain_with_soa() {
        let handler = handler_with(&[]).await;
        let response = exchange(
            &handler,
            &query_message("nobody.acme.example.com.", RecordType::TXT),
        )
        .await;
        assert_eq!(response.id(), 4242);
        assert_eq!(response.response_code(), ResponseCode::NXDomain);
        assert!(response.authoritative());
        assert!(!response.recursion_available());
        assert!(response.answers().is_empty());
        assert_eq!(response.name_servers()[0].rr_type(), RecordType::SOA);
    }

    #[tokio::test]
    async fn empty_window_is_nodata_not_nxdomain() {
        let handler = handler_with(&[]).await;
        let (record, _) = handler.store.register(vec![]).await.unwrap();
        let response = exchange(
            &handler,
            &query_message(
                &format!("{}.acme.example.com.", record.subdomain),
                RecordType::TXT,
            ),
        )
        .await;
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert!(response.answers().is_empty());
        assert!(response.authoritative());
    }

    #[tokio::test]
    async fn serves_window_newest_first_regardless_of_case() {
        let handler = handler_with(&[]).await;
        let (record, _) = handler.store.register(vec![]).await.unwrap();
        let sub = &record.subdomain;
        handler
            .store
            .push_challenge_value(sub, digest('A'))
            .await
            .unwrap();
        handler
            .store
            .push_challenge_value(sub, digest('B'))
            .await
            .unwrap();

        for name in [
            format!("{sub}.acme.example.com."),
            format!("{}.ACME.Example.COM.", sub.to_uppercase()),
        ] {
            let response = exchange(&handler, &query_message(&name, RecordType::TXT)).await;
            assert_eq!(response.response_code(), ResponseCode::NoError);
            assert_eq!(txt_values(&response), vec![digest('B'), digest('A')]);
            assert!(response.answers().iter().all(|r| r.ttl() == TXT_TTL));
        }

        let response = exchange(
            &handler,
            &query_message(&format!("{sub}.acme.example.com."), RecordType::A),
        )
        .await;
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert!(response.answers().is_empty());
    }

    #[tokio::test]
    async fn captured_query_bytes() {
        let handler = handler_with(&[]).await;
        handler
            .store
            .push_challenge_value(ACME_CHALLENGE_LABEL, digest('C'))
            .await
            .unwrap();

        // dig +noedns _acme-challenge.acme.example.com TXT
        let query = [
            &[0xbe, 0xef, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00][..],
            b"\x0f_acme-challenge\x04acme\x07example\x03com\x00",
            &[0x00, 0x10, 0x00, 0x01],
        ]
        .concat();
        let response = exchange_bytes(&handler, &query, Protocol::Udp).await;
        assert_eq!(response.id(), 0xbeef);
        assert!(response.recursion_desired());
        assert_eq!(txt_values(&response), vec![digest('C')]);
        assert!(response.extensions().is_none());

        // The same query with an EDNS0 OPT advertising 4096 bytes.
        let mut with_opt = query.clone();
        with_opt[11] = 0x01;
        with_opt.extend_from_slice(&[0x00, 0x00, 0x29, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
        let response = exchange_bytes(&handler, &with_opt, Protocol::Udp).await;
        assert_eq!(txt_values(&response), vec![digest('C')]);
        let edns = response.extensions().as_ref().expect("OPT in response");
        assert_eq!(edns.max_payload(), EDNS_MAX_PAYLOAD);
    }

    #[tokio::test]
    async fn answers_static_records_and_apex() {
        let handler = handler_with(&["www A 192.0.2.80"]).await;

        let response = exchange(
            &handler,
            &query_message("WWW.acme.example.com.", RecordType::A),
        )
        .await;
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert_eq!(response.answers().len(), 1);
        assert!(response.authoritative());

        let response = exchange(
            &handler,
            &query_message("acme.example.com.", RecordType::SOA),
        )
        .await;
        assert_eq!(response.answers()[0].rr_type(), RecordType::SOA);

        let response = exchange(
            &handler,
            &query_message("www.acme.example.com.", RecordType::AAAA),
        )
        .await;
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert!(response.answers().is_empty());
        assert_eq!(response.name_servers()[0].rr_type(), RecordType::SOA);
    }

    #[tokio::test]
    async fn static_names_win_over_store_labels() {
        let handler = handler_with(&[r#"_acme-challenge TXT "static""#]).await;
        handler
            .store
            .push_challenge_value(ACME_CHALLENGE_LABEL, digest('D'))
            .await
            .unwrap();
        let response = exchange(
            &handler,
            &query_message("_acme-challenge.acme.example.com.", RecordType::TXT),
        )
        .await;
        assert_eq!(txt_values(&response), vec!["static".to_string()]);
    }

    #[tokio::test]
    async fn refuses_foreign_zones_and_classes() {
        let handler = handler_with(&[]).await;
        let response = exchange(&handler, &query_message("example.org.", RecordType::TXT)).await;
        assert_eq!(response.response_code(), ResponseCode::Refused);
        assert!(response.answers().is_empty());

        let answer = handler
            .resolve(
                &LowerName::from(Name::from_str("acme.example.com.").unwrap()),
                RecordType::SOA,
                DNSClass::CH,
            )
            .await;
        assert_eq!(answer.code, ResponseCode::Refused);
    }

    #[tokio::test]
    async fn deep_names_are_nxdomain() {
        let handler = handler_with(&[]).await;
        let response = exchange(
            &handler,
            &query_message("a._acme-challenge.acme.example.com.", RecordType::TXT),
        )
        .await;
        assert_eq!(response.response_code(), ResponseCode::NXDomain);
    }

    #[tokio::test]
    async fn unsupported_opcode_is_notimp() {
        let handler = handler_with(&[]).await;
        let mut message = query_message("acme.example.com.", RecordType::SOA);
        message.set_op_code(OpCode::Status);
        let response = exchange(&handler, &message).await;
        assert_eq!(response.response_code(), ResponseCode::NotImp);
    }

    #[tokio::test]
    async fn stalled_store_lookup_is_servfail() {
        let config = Config::try_from_json(EXAMPLE).unwrap();
        let zone = Arc::new(Zone::try_from_config(&config).unwrap());
        let backend = SlowBackend {
            delay: Duration::from_secs(5),
            ..SlowBackend::default()
        };
        let store = Arc::new(RecordStore::open(backend, BCRYPT_MIN_COST).await.unwrap());
        let (record, _) = store.register(vec![]).await.unwrap();
        let handler = Handler::new(zone, store.clone(), Duration::from_millis(200));

        // A push holds the record's write lock for the whole slow save.
        let sub = record.subdomain.clone();
        let writer = tokio::spawn(async move { store.push_challenge_value(&sub, digest('A')).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        let response = exchange(
            &handler,
            &query_message(&format!("{}.acme.example.com.", record.subdomain), RecordType::TXT),
        )
        .await;
        let elapsed = started.elapsed();
        assert_eq!(response.response_code(), ResponseCode::ServFail);
        assert!(response.answers().is_empty());
        assert!(elapsed >= Duration::from_millis(200), "answered after {elapsed:?}");
        assert!(elapsed < Duration::from_secs(2), "answered after {elapsed:?}");
        writer.abort();
    }

    #[tokio::test]
    async fn large_answers_are_truncated_over_udp_only() {
        let long = "x".repeat(200);
        let lines: Vec<String> = (0..6).map(|i| format!("big TXT \"{i}{long}\"")).collect();
        let lines: Vec<&str> = lines.iter().map(String::as_str).collect();
        let handler = handler_with(&lines).await;
        let message = query_message("big.acme.example.com.", RecordType::TXT);
        let bytes = message.to_vec().unwrap();

        let udp = exchange_bytes(&handler, &bytes, Protocol::Udp).await;
        assert!(udp.truncated());
        assert!(udp.answers().len() < 6);
        assert!(udp.to_vec().unwrap().len() <= 512);

        let tcp = exchange_bytes(&handler, &bytes, Protocol::Tcp).await;
        assert!(!tcp.truncated());
        assert_eq!(tcp.answers().len(), 6);

        let mut with_edns = message.clone();
        let mut edns = Edns::new();
        edns.set_max_payload(4096);
        with_edns.set_edns(edns);
        let udp_edns = exchange(&handler, &with_edns).await;
        assert!(!udp_edns.truncated());
        assert_eq!(udp_edns.answers().len(), 6);
    }

    #[test]
    fn take_fitting_stops_at_budget() {
        let record = |i: u8| {
            Record::from_rdata(
                Name::from_str("a.example.").unwrap(),
                1,
                RData::TXT(TXT::new(vec![i.to_string()])),
            )
        };
        let len = record(0).to_bytes().unwrap().len();
        let mut budget = len * 2 + 1;
        let (kept, truncated) = take_fitting(vec![record(0), record(1), record(2)], &mut budget);
        assert_eq!(kept.len(), 2);
        assert!(truncated);
        assert_eq!(budget, 1);
    }
}
