use crate::rpcpb::{self, RetryInfo, RETRY_INFO_KEY, RETRY_INFO_TYPE_URL};
use prost::Message;
use std::time::Duration;
use tonic::Status;

fn to_std(retry: RetryInfo) -> Option<Duration> {
    match Duration::try_from(retry.retry_delay?) {
        Ok(d) => Some(d),
        Err(e) => {
            log::warn!("could not parse retry delay: {}", e);
            None
        }
    }
}

fn from_trailer(status: &Status) -> Option<Duration> {
    let value = status.metadata().get_bin(RETRY_INFO_KEY)?;
    let bytes = match value.to_bytes() {
        Ok(bytes) => bytes,
        Err(e) => {
            log::warn!("failed to read retry trailer: {}", e);
            return None;
        }
    };
    match RetryInfo::decode(bytes) {
        Ok(retry) => to_std(retry),
        Err(e) => {
            log::warn!("failed to read retry trailer: {}", e);
            None
        }
    }
}

fn from_details(status: &Status) -> Option<Duration> {
    if status.details().is_empty() {
        return None;
    }
    let rich = match rpcpb::Status::decode(status.details()) {
        Ok(rich) => rich,
        Err(e) => {
            log::warn!("failed to read status details: {}", e);
            return None;
        }
    };
    let any = rich.details.into_iter().find(|d| d.type_url == RETRY_INFO_TYPE_URL)?;
    match RetryInfo::decode(any.value.as_slice()) {
        Ok(retry) => to_std(retry),
        Err(e) => {
            log::warn!("failed to read RetryInfo detail: {}", e);
            None
        }
    }
}

/// The delay the server asked for, carried either as a `RetryInfo` trailer
/// or as a detail of the rich status.
pub fn server_advised_delay(status: &Status) -> Option<Duration> {
    from_trailer(status).or_else(|| from_details(status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::codegen::Bytes;
    use tonic::metadata::{MetadataMap, MetadataValue};
    use tonic::Code;

    fn retry_info(seconds: i64) -> RetryInfo {
        RetryInfo {
            retry_delay: Some(prost_types::Duration { seconds, nanos: 0 }),
        }
    }

    #[test]
    fn test_delay_from_trailer() {
        let mut md = MetadataMap::new();
        md.insert_bin(
            RETRY_INFO_KEY,
            MetadataValue::from_bytes(&retry_info(42).encode_to_vec()),
        );
        let status = Status::with_metadata(Code::Aborted, "come back later", md);
        assert_eq!(server_advised_delay(&status), Some(Duration::from_secs(42)));
    }

    #[test]
    fn test_delay_from_status_details() {
        let rich = rpcpb::Status {
            code: Code::Aborted as i32,
            message: "come back later".into(),
            details: vec![prost_types::Any {
                type_url: RETRY_INFO_TYPE_URL.into(),
                value: retry_info(7).encode_to_vec(),
            }],
        };
        let status = Status::with_details(
            Code::Aborted,
            "come back later",
            Bytes::from(rich.encode_to_vec()),
        );
        assert_eq!(server_advised_delay(&status), Some(Duration::from_secs(7)));
    }

    #[test]
    fn test_no_or_garbled_delay() {
        assert_eq!(server_advised_delay(&Status::unavailable("down")), None);

        let mut md = MetadataMap::new();
        md.insert_bin(RETRY_INFO_KEY, MetadataValue::from_bytes(b"\xff\xff\xff"));
        let status = Status::with_metadata(Code::Aborted, "garbled", md);
        assert_eq!(server_advised_delay(&status), None);

        let negative = RetryInfo {
            retry_delay: Some(prost_types::Duration { seconds: -3, nanos: 0 }),
        };
        let mut md = MetadataMap::new();
        md.insert_bin(RETRY_INFO_KEY, MetadataValue::from_bytes(&negative.encode_to_vec()));
        let status = Status::with_metadata(Code::Aborted, "negative", md);
        assert_eq!(server_advised_delay(&status), None);
    }
}
