use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use rand::Rng;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tokio::time::timeout;

use crate::query::{NameserverClient, NsAnswer, QueryError};
use crate::util::names::clean_domain;
use crate::util::net::{read_tcp_bytes, send_tcp_bytes};

/// Per-query timeout, covering address lookup, UDP, and any TCP
/// retry.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// UDP responses bigger than this come back truncated.
const UDP_BUFFER_SIZE: usize = 512;

/// Asks real nameservers, over UDP with a TCP fallback for truncated
/// responses.
#[derive(Debug, Clone)]
pub struct NetworkClient {
    timeout: Duration,
    port: u16,
}

impl Default for NetworkClient {
    fn default() -> Self {
        Self::new(DEFAULT_QUERY_TIMEOUT)
    }
}

impl NetworkClient {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout, port: 53 }
    }

    /// Talk to nameservers on a port other than 53.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Timeout-less version of `query_ns`.
    async fn query_ns_notimeout(&self, server: &str, zone: &str) -> Result<NsAnswer, QueryError> {
        let address = self.nameserver_address(server).await?;
        let request = ns_request(rand::thread_rng().gen(), zone)?;
        let serialised = request
            .to_vec()
            .map_err(|err| QueryError::Serialise(err.to_string()))?;

        let mut response = query_nameserver_udp(address, &serialised).await?;
        if response.truncated() {
            tracing::trace!(%address, "truncated - retrying over tcp");
            response = query_nameserver_tcp(address, &serialised).await?;
        }

        if !response_matches_request(&request, &response) {
            return Err(QueryError::Mismatch);
        }

        Ok(ns_answer(&response))
    }

    /// Find the address to use for a nameserver.  IPv4 is preferred
    /// if the name has both.
    async fn nameserver_address(&self, server: &str) -> Result<SocketAddr, QueryError> {
        if let Ok(ip) = server.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, self.port));
        }

        let addresses = lookup_host((server, self.port))
            .await
            .map_err(|err| QueryError::NoAddress {
                server: server.to_string(),
                reason: err.to_string(),
            })?
            .collect::<Vec<_>>();

        addresses
            .iter()
            .find(|address| address.is_ipv4())
            .or_else(|| addresses.first())
            .copied()
            .ok_or_else(|| QueryError::NoAddress {
                server: server.to_string(),
                reason: "no addresses".to_string(),
            })
    }
}

#[async_trait]
impl NameserverClient for NetworkClient {
    async fn query_ns(&self, server: &str, zone: &str) -> Result<NsAnswer, QueryError> {
        if let Ok(res) = timeout(self.timeout, self.query_ns_notimeout(server, zone)).await {
            res
        } else {
            tracing::debug!(%server, %zone, "timed out");
            Err(QueryError::Timeout(self.timeout))
        }
    }
}

/// Build a non-recursive NS query for `zone`.
pub fn ns_request(id: u16, zone: &str) -> Result<Message, QueryError> {
    let name = Name::from_ascii(format!("{}.", clean_domain(zone)))
        .map_err(|err| QueryError::Serialise(err.to_string()))?;

    let mut request = Message::new();
    request
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(false)
        .add_query(Query::query(name, RecordType::NS));

    Ok(request)
}

/// Send a message to a remote nameserver over UDP, returning the
/// response.  This response is NOT validated.
async fn query_nameserver_udp(
    address: SocketAddr,
    serialised_request: &[u8],
) -> Result<Message, QueryError> {
    let local: SocketAddr = if address.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };

    let sock = UdpSocket::bind(local).await.map_err(io_error)?;
    sock.connect(address).await.map_err(io_error)?;
    sock.send(serialised_request).await.map_err(io_error)?;

    let mut buf = vec![0u8; UDP_BUFFER_SIZE];
    let size = sock.recv(&mut buf).await.map_err(io_error)?;
    Message::from_vec(&buf[..size]).map_err(|err| QueryError::Deserialise(err.to_string()))
}

/// Send a message to a remote nameserver over TCP, returning the
/// response.  This response is NOT validated.
async fn query_nameserver_tcp(
    address: SocketAddr,
    serialised_request: &[u8],
) -> Result<Message, QueryError> {
    let mut stream = TcpStream::connect(address).await.map_err(io_error)?;
    send_tcp_bytes(&mut stream, serialised_request)
        .await
        .map_err(|err| QueryError::IO(err.to_string()))?;
    let bytes = read_tcp_bytes(&mut stream)
        .await
        .map_err(|err| QueryError::IO(err.to_string()))?;
    Message::from_vec(bytes.as_ref()).map_err(|err| QueryError::Deserialise(err.to_string()))
}

fn io_error(err: std::io::Error) -> QueryError {
    QueryError::IO(err.to_string())
}

/// Very basic validation that a nameserver response matches a
/// request:
///
/// - Check the ID, opcode, and questions match the question.
///
/// - Check it is a response.
///
/// The response code is not checked: a `REFUSED` or `NXDOMAIN` from a
/// delegated nameserver is itself evidence for the audit.
pub fn response_matches_request(request: &Message, response: &Message) -> bool {
    if request.id() != response.id() {
        return false;
    }
    if response.message_type() != MessageType::Response {
        return false;
    }
    if request.op_code() != response.op_code() {
        return false;
    }
    if request.queries() != response.queries() {
        return false;
    }

    true
}

/// Pull the NS targets out of the ANSWER and AUTHORITY sections.
pub fn ns_answer(response: &Message) -> NsAnswer {
    let nameservers = response
        .answers()
        .iter()
        .chain(response.name_servers())
        .filter_map(|rr| match rr.data() {
            Some(RData::NS(ns)) => Some(clean_domain(&ns.0.to_ascii())),
            _ => None,
        })
        .collect();

    NsAnswer {
        nameservers,
        authoritative: response.authoritative(),
    }
}

#[cfg(test)]
mod tests {
    use hickory_proto::op::ResponseCode;
    use hickory_proto::rr::rdata::{A, NS};
    use hickory_proto::rr::Record;
    use tokio::net::TcpListener;

    use super::*;

    fn ns_rr(owner: &str, target: &str) -> Record {
        Record::from_rdata(
            Name::from_ascii(owner).unwrap(),
            300,
            RData::NS(NS(Name::from_ascii(target).unwrap())),
        )
    }

    fn matching_response(request: &Message) -> Message {
        let mut response = Message::new();
        response
            .set_id(request.id())
            .set_message_type(MessageType::Response)
            .set_op_code(request.op_code())
            .add_queries(request.queries().to_vec());
        response
    }

    #[test]
    fn ns_request_is_non_recursive_ns_query() {
        let request = ns_request(1234, "Example.COM").unwrap();

        assert_eq!(1234, request.id());
        assert!(!request.recursion_desired());
        assert_eq!(1, request.queries().len());
        assert_eq!(RecordType::NS, request.queries()[0].query_type());
        assert_eq!("example.com.", request.queries()[0].name().to_ascii());
    }

    #[test]
    fn response_matches_request_accepts() {
        let request = ns_request(1234, "example.com").unwrap();
        let response = matching_response(&request);

        assert!(response_matches_request(&request, &response));
    }

    #[test]
    fn response_matches_request_checks_id() {
        let request = ns_request(1234, "example.com").unwrap();
        let mut response = matching_response(&request);
        response.set_id(1235);

        assert!(!response_matches_request(&request, &response));
    }

    #[test]
    fn response_matches_request_checks_qr() {
        let request = ns_request(1234, "example.com").unwrap();
        let mut response = matching_response(&request);
        response.set_message_type(MessageType::Query);

        assert!(!response_matches_request(&request, &response));
    }

    #[test]
    fn response_matches_request_checks_question() {
        let request = ns_request(1234, "example.com").unwrap();
        let other = ns_request(1234, "example.net").unwrap();
        let response = matching_response(&other);

        assert!(!response_matches_request(&request, &response));
    }

    #[test]
    fn response_matches_request_does_not_check_rcode() {
        let request = ns_request(1234, "example.com").unwrap();
        let mut response = matching_response(&request);
        response.set_response_code(ResponseCode::Refused);

        assert!(response_matches_request(&request, &response));
    }

    #[test]
    fn ns_answer_reads_answer_and_authority_sections() {
        let request = ns_request(1234, "example.com").unwrap();
        let mut response = matching_response(&request);
        response
            .set_authoritative(true)
            .add_answer(ns_rr("example.com.", "NS1.example.net."))
            .add_name_server(ns_rr("example.com.", "ns2.example.net."))
            .add_additional(Record::from_rdata(
                Name::from_ascii("ns1.example.net.").unwrap(),
                300,
                RData::A(A::new(192, 0, 2, 1)),
            ));

        assert_eq!(
            NsAnswer {
                nameservers: vec!["ns1.example.net".to_string(), "ns2.example.net".to_string()],
                authoritative: true,
            },
            ns_answer(&response)
        );
    }

    #[tokio::test]
    async fn queries_over_udp() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            let (size, peer) = server.recv_from(&mut buf).await.unwrap();
            let request = Message::from_vec(&buf[..size]).unwrap();
            let mut response = matching_response(&request);
            response
                .set_authoritative(true)
                .add_answer(ns_rr("example.com.", "ns1.example.net."));
            server.send_to(&response.to_vec().unwrap(), peer).await.unwrap();
        });

        let client = NetworkClient::new(Duration::from_secs(5)).with_port(port);
        let answer = client.query_ns("127.0.0.1", "example.com").await.unwrap();

        assert!(answer.authoritative);
        assert_eq!(vec!["ns1.example.net".to_string()], answer.nameservers);
    }

    #[tokio::test]
    async fn falls_back_to_tcp_when_truncated() {
        let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = udp.local_addr().unwrap().port();
        let tcp = TcpListener::bind(("127.0.0.1", port)).await.unwrap();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            let (size, peer) = udp.recv_from(&mut buf).await.unwrap();
            let request = Message::from_vec(&buf[..size]).unwrap();
            let mut response = matching_response(&request);
            response.set_truncated(true);
            udp.send_to(&response.to_vec().unwrap(), peer).await.unwrap();
        });

        tokio::spawn(async move {
            let (mut stream, _) = tcp.accept().await.unwrap();
            let bytes = read_tcp_bytes(&mut stream).await.unwrap();
            let request = Message::from_vec(bytes.as_ref()).unwrap();
            let mut response = matching_response(&request);
            response
                .add_answer(ns_rr("example.com.", "ns1.example.net."))
                .add_answer(ns_rr("example.com.", "ns2.example.net."));
            send_tcp_bytes(&mut stream, &response.to_vec().unwrap())
                .await
                .unwrap();
        });

        let client = NetworkClient::new(Duration::from_secs(5)).with_port(port);
        let answer = client.query_ns("127.0.0.1", "example.com").await.unwrap();

        assert!(!answer.authoritative);
        assert_eq!(2, answer.nameservers.len());
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();

        let client = NetworkClient::new(Duration::from_millis(100)).with_port(port);

        assert_eq!(
            Err(QueryError::Timeout(Duration::from_millis(100))),
            client.query_ns("127.0.0.1", "example.com").await
        );
        drop(server);
    }
}
