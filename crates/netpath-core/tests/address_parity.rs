//! `Address` zero/either-zero parity: `is_zero` requires both IP and port
//! unset; `is_either_zero` is satisfied by either alone.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use netpath_core::Address;

#[test]
fn is_zero_true_only_for_fully_unset_address() {
    let v4_zero = Address::from_ip_port(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
    let v6_zero = Address::from_ip_port(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0);
    assert!(v4_zero.is_zero());
    assert!(v6_zero.is_zero());
    assert!(v4_zero.is_either_zero());
    assert!(v6_zero.is_either_zero());
}

#[test]
fn is_zero_false_when_either_half_is_set() {
    let ip_only = Address::from_ip_port(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7)), 0);
    assert!(!ip_only.is_zero());
    assert!(ip_only.is_either_zero());

    let port_only = Address::from_ip_port(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 9000);
    assert!(!port_only.is_zero());
    assert!(port_only.is_either_zero());

    let both_set = Address::from_ip_port(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7)), 9000);
    assert!(!both_set.is_zero());
    assert!(!both_set.is_either_zero());
}
