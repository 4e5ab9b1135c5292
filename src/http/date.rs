//! `Date` header cache.
//!
//! Formatting an HTTP date on every response is wasteful; each worker thread
//! keeps the last formatted value and refreshes it once per second.

use std::cell::RefCell;
use std::time::{SystemTime, UNIX_EPOCH};

use http::HeaderValue;

struct DateCache {
    second: u64,
    value: HeaderValue,
}

impl DateCache {
    fn render(now: SystemTime) -> HeaderValue {
        // IMF-fixdate is plain ASCII
        HeaderValue::from_str(&httpdate::fmt_http_date(now))
            .unwrap_or_else(|_| HeaderValue::from_static("Thu, 01 Jan 1970 00:00:00 GMT"))
    }

    fn at(now: SystemTime) -> Self {
        Self {
            second: unix_second(now),
            value: Self::render(now),
        }
    }

    fn get(&mut self, now: SystemTime) -> HeaderValue {
        let second = unix_second(now);
        if second != self.second {
            *self = Self::at(now);
        }
        self.value.clone()
    }
}

fn unix_second(now: SystemTime) -> u64 {
    now.duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

thread_local! {
    static DATE_CACHE: RefCell<DateCache> = RefCell::new(DateCache::at(SystemTime::now()));
}

/// Current time formatted for the `date` header.
pub fn http_date() -> HeaderValue {
    DATE_CACHE.with(|cache| cache.borrow_mut().get(SystemTime::now()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn formats_imf_fixdate() {
        let cache = DateCache::at(UNIX_EPOCH + Duration::from_secs(784_111_777));
        assert_eq!(cache.value, "Sun, 06 Nov 1994 08:49:37 GMT");
    }

    #[test]
    fn refreshes_on_new_second() {
        let start = UNIX_EPOCH + Duration::from_secs(784_111_777);
        let mut cache = DateCache::at(start);
        assert_eq!(cache.get(start + Duration::from_millis(900)), "Sun, 06 Nov 1994 08:49:37 GMT");
        assert_eq!(cache.get(start + Duration::from_secs(1)), "Sun, 06 Nov 1994 08:49:38 GMT");
    }

    #[test]
    fn thread_local_value_parses() {
        let value = http_date();
        assert!(httpdate::parse_http_date(value.to_str().unwrap()).is_ok());
    }
}
