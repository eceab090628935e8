use std::io;

use anyhow::Result;
use egress::{BlockReason, DomainPattern, Error, ErrorKind, FetchParams, Gateway, resolver_fn};

use super::common::{PUBLIC_ADDR, public_resolver, recording_transport, resolver};

fn blocked_reason(err: &Error) -> Option<&BlockReason> {
    match err {
        Error::AddressBlocked { reason, .. } => Some(reason),
        _ => None,
    }
}

#[tokio::test]
async fn denied_range_never_reaches_transport() -> Result<()> {
    let (transport, recorded) = recording_transport();
    let gateway = Gateway::builder(transport)
        .ip_deny(["10.0.0.0/8".parse::<ipnet::IpNet>()?])
        .resolver(resolver(&["10.1.2.3"]))
        .build();

    let err = gateway
        .fetch("http://internal.example/", FetchParams::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AddressBlocked);
    assert_eq!(
        blocked_reason(&err),
        Some(&BlockReason::IpDenied("10.1.2.3".parse()?))
    );
    assert!(recorded.requests().is_empty());
    Ok(())
}

#[tokio::test]
async fn any_denied_address_blocks_the_host() -> Result<()> {
    let (transport, recorded) = recording_transport();
    let gateway = Gateway::builder(transport)
        .deny_private_ranges()
        .resolver(resolver(&[PUBLIC_ADDR, "127.0.0.1"]))
        .build();

    let err = gateway
        .fetch("https://rebind.example/", FetchParams::new())
        .await
        .unwrap_err();
    assert_eq!(
        blocked_reason(&err),
        Some(&BlockReason::IpDenied("127.0.0.1".parse()?))
    );
    assert!(recorded.requests().is_empty());
    Ok(())
}

#[tokio::test]
async fn literal_addresses_need_opt_in() -> Result<()> {
    let (transport, recorded) = recording_transport();
    let gateway = Gateway::builder(transport.clone()).build();
    let err = gateway
        .fetch(&format!("http://{PUBLIC_ADDR}/"), FetchParams::new())
        .await
        .unwrap_err();
    assert_eq!(blocked_reason(&err), Some(&BlockReason::DirectIpDenied));

    let gateway = Gateway::builder(transport)
        .allow_direct_ip(true)
        .deny_private_ranges()
        .build();
    let res = gateway
        .fetch(&format!("http://{PUBLIC_ADDR}/"), FetchParams::new())
        .await?;
    assert!(res.ok);

    let err = gateway
        .fetch("http://[::1]:8080/", FetchParams::new())
        .await
        .unwrap_err();
    assert_eq!(
        blocked_reason(&err),
        Some(&BlockReason::IpDenied("::1".parse()?))
    );
    assert_eq!(recorded.requests().len(), 1);
    Ok(())
}

#[tokio::test]
async fn domain_patterns_filter_hosts() -> Result<()> {
    let (transport, _recorded) = recording_transport();
    let gateway = Gateway::builder(transport)
        .domain_allow([DomainPattern::regex(r"^(.+\.)?example\.com$")?])
        .domain_deny([DomainPattern::exact("secret.example.com")])
        .resolver(public_resolver())
        .build();

    assert!(
        gateway
            .fetch("https://api.example.com/v1", FetchParams::new())
            .await?
            .ok
    );
    assert!(
        gateway
            .fetch("https://EXAMPLE.com./", FetchParams::new())
            .await?
            .ok
    );

    let err = gateway
        .fetch("https://example.org/", FetchParams::new())
        .await
        .unwrap_err();
    assert_eq!(blocked_reason(&err), Some(&BlockReason::DomainNotAllowed));

    let err = gateway
        .fetch("https://secret.example.com/", FetchParams::new())
        .await
        .unwrap_err();
    assert!(matches!(
        blocked_reason(&err),
        Some(BlockReason::DomainDenied(_))
    ));
    Ok(())
}

#[tokio::test]
async fn resolution_failures_are_refusals() -> Result<()> {
    let (transport, recorded) = recording_transport();
    let gateway = Gateway::builder(transport.clone())
        .resolver(resolver_fn(|host, _port| async move {
            Err(io::Error::other(format!("no such host: {host}")))
        }))
        .build();
    let err = gateway
        .fetch("http://missing.example/", FetchParams::new())
        .await
        .unwrap_err();
    assert!(matches!(
        blocked_reason(&err),
        Some(BlockReason::Resolution(_))
    ));

    let gateway = Gateway::builder(transport)
        .resolver(resolver(&[]))
        .build();
    let err = gateway
        .fetch("http://empty.example/", FetchParams::new())
        .await
        .unwrap_err();
    assert_eq!(blocked_reason(&err), Some(&BlockReason::NoAddresses));
    assert!(recorded.requests().is_empty());
    Ok(())
}

#[tokio::test]
async fn unsupported_urls_are_invalid_requests() -> Result<()> {
    let (transport, recorded) = recording_transport();
    let gateway = Gateway::builder(transport)
        .resolver(public_resolver())
        .build();

    for url in ["ftp://example.com/file", "not a url", "file:///etc/passwd"] {
        let err = gateway.fetch(url, FetchParams::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest, "{url}");
    }
    assert!(recorded.requests().is_empty());
    Ok(())
}
