pub mod address;
pub mod protocol;

pub use address::{build_pasv_string, build_port_string, parse_pasv_reply, parse_port_string};
pub use protocol::{
    build_request_line, build_status_line, find_line_end, parse_request_line,
    parse_response_line, Method, ProtocolError, Request, Response, StatusCode, CRLF,
};
