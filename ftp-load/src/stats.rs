//! Block statistics.
//!
//! Each block owns one `Arc<Mutex<…>>` of counters that connection tasks,
//! the I/O task and callers of `stats()` share.  Critical sections are a few
//! increments, so a std mutex is enough; a poisoned lock is recovered rather
//! than propagated.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ftp_proto::{Method, StatusCode};

pub type SharedStats<T> = Arc<Mutex<T>>;

/// Lock `stats`, ignoring poisoning.
pub fn lock<T>(stats: &Mutex<T>) -> MutexGuard<'_, T> {
    stats.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One counter per reply code the load generator understands.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseCodeCounters {
    pub code_150: u64,
    pub code_200: u64,
    pub code_220: u64,
    pub code_226: u64,
    pub code_227: u64,
    pub code_230: u64,
    pub code_331: u64,
    pub code_425: u64,
    pub code_426: u64,
    pub code_452: u64,
    pub code_500: u64,
    pub code_502: u64,
    pub code_530: u64,
}

impl ResponseCodeCounters {
    /// Count `code`.  125, 250 and the invalid sentinel have no counter.
    pub fn bump(&mut self, code: StatusCode) {
        let slot = match code {
            StatusCode::FileStatusOk => &mut self.code_150,
            StatusCode::Ok => &mut self.code_200,
            StatusCode::ServiceReady => &mut self.code_220,
            StatusCode::ClosingDataConn => &mut self.code_226,
            StatusCode::EnteringPassiveMode => &mut self.code_227,
            StatusCode::UserLoggedIn => &mut self.code_230,
            StatusCode::NeedPassword => &mut self.code_331,
            StatusCode::DataConnFailed => &mut self.code_425,
            StatusCode::TransferAborted => &mut self.code_426,
            StatusCode::ActionNotTaken => &mut self.code_452,
            StatusCode::SyntaxError => &mut self.code_500,
            StatusCode::NotImplemented => &mut self.code_502,
            StatusCode::NotLoggedIn => &mut self.code_530,
            StatusCode::DataConnAlreadyOpen
            | StatusCode::FileActionComplete
            | StatusCode::Invalid => return,
        };
        *slot += 1;
    }
}

/// Counters kept by a client block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientStats {
    pub attempted_connections: u64,
    pub successful_connections: u64,
    /// Connections that never opened.
    pub unsuccessful_connections: u64,
    /// Open connections reaped by the block.
    pub aborted_connections: u64,
    pub active_connections: u32,
    /// Last load value the scheduler asked for.
    pub intended_load: i64,

    pub attempted_transactions: u64,
    pub successful_transactions: u64,
    pub unsuccessful_transactions: u64,
    pub aborted_transactions: u64,

    pub rx_response_codes: ResponseCodeCounters,

    pub goodput_tx_bytes: u64,
    pub goodput_rx_bytes: u64,
    /// Sum of per-transfer rates over successful transactions.
    pub cumulative_file_transfer_bps: u64,
}

/// One counter per request verb the server understands.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestCounters {
    pub user: u64,
    pub pass: u64,
    pub type_: u64,
    pub port: u64,
    pub pasv: u64,
    pub retr: u64,
    pub stor: u64,
    pub quit: u64,
}

impl RequestCounters {
    pub fn bump(&mut self, method: Method) {
        let slot = match method {
            Method::User => &mut self.user,
            Method::Pass => &mut self.pass,
            Method::Type => &mut self.type_,
            Method::Port => &mut self.port,
            Method::Pasv => &mut self.pasv,
            Method::Retr => &mut self.retr,
            Method::Stor => &mut self.stor,
            Method::Quit => &mut self.quit,
            Method::Mode | Method::Unknown => return,
        };
        *slot += 1;
    }
}

/// Counters kept by a server block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    /// Connections accepted since the block was created.
    pub total_control_connections: u64,
    pub active_control_connections: u32,
    pub total_data_connections: u64,

    pub attempted_transactions: u64,
    pub successful_transactions: u64,
    pub unsuccessful_transactions: u64,
    pub aborted_transactions: u64,

    pub rx_commands: RequestCounters,
    pub tx_response_codes: ResponseCodeCounters,

    pub goodput_tx_bytes: u64,
    pub goodput_rx_bytes: u64,
}

/// Bits per second for `bytes` moved in `millis`.
pub fn transfer_bps(bytes: u64, millis: u64) -> u64 {
    (bytes / millis.max(1)) * 8000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_counts_known_codes_only() {
        let mut c = ResponseCodeCounters::default();
        c.bump(StatusCode::Ok);
        c.bump(StatusCode::Ok);
        c.bump(StatusCode::NotLoggedIn);
        c.bump(StatusCode::Invalid);
        c.bump(StatusCode::FileActionComplete);
        assert_eq!(c.code_200, 2);
        assert_eq!(c.code_530, 1);
        assert_eq!(
            c,
            ResponseCodeCounters {
                code_200: 2,
                code_530: 1,
                ..Default::default()
            }
        );
    }

    #[test]
    fn request_counters_skip_mode() {
        let mut r = RequestCounters::default();
        r.bump(Method::Mode);
        r.bump(Method::Retr);
        assert_eq!(r, RequestCounters { retr: 1, ..Default::default() });
    }

    #[test]
    fn bps_uses_at_least_one_millisecond() {
        assert_eq!(transfer_bps(1000, 0), 8_000_000);
        assert_eq!(transfer_bps(10_000, 10), 8_000_000);
    }

    #[test]
    fn poisoned_lock_is_recovered() {
        let stats: SharedStats<ClientStats> = Arc::default();
        let s2 = stats.clone();
        let _ = std::thread::spawn(move || {
            let _g = s2.lock().unwrap();
            panic!("poison");
        })
        .join();
        lock(&stats).attempted_connections += 1;
        assert_eq!(lock(&stats).attempted_connections, 1);
    }
}
