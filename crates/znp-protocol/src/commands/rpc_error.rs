//! RPC error responses
//!
//! When the coprocessor cannot recognize an SREQ it answers with this SRSP
//! instead of the expected one, echoing the offending request's header.

use crate::frame::CommandHeader;
use crate::types::RpcErrorCode;

mt_command! {
    srsp CommandNotRecognized / RpcCommandNotRecognized / CommandNotRecognizedPattern (RpcError, 0x00) {
        error_code: RpcErrorCode,
        request_header: CommandHeader,
    }
}
