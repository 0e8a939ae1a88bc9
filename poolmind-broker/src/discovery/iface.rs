use std::collections::BTreeMap;
use std::io;
use std::net::Ipv4Addr;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InterfaceInfo {
    pub name: String,
    pub index: u32,
    pub up: bool,
    pub multicast: bool,
    pub loopback: bool,
    pub ipv4: Option<Ipv4Addr>,
}

/// Where multicast membership (and outgoing queries) should go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MulticastInterface {
    Addr { name: String, addr: Ipv4Addr },
    Index { name: String, index: u32 },
    /// Let the OS route it
    Default,
}

impl MulticastInterface {
    /// Address to hand to `IP_ADD_MEMBERSHIP` / `IP_MULTICAST_IF`
    pub fn membership_addr(&self) -> Ipv4Addr {
        match self {
            MulticastInterface::Addr { addr, .. } => *addr,
            _ => Ipv4Addr::UNSPECIFIED,
        }
    }
}

/// First up, multicast capable, non-loopback interface with an IPv4
/// address; else the first up + multicast interface by index; else
/// whatever the platform defaults to
pub fn select_interface(interfaces: &[InterfaceInfo]) -> MulticastInterface {
    if let Some((iface, addr)) = interfaces
        .iter()
        .filter(|i| i.up && i.multicast && !i.loopback)
        .find_map(|i| i.ipv4.map(|addr| (i, addr)))
    {
        return MulticastInterface::Addr {
            name: iface.name.clone(),
            addr,
        };
    }

    if let Some(iface) = interfaces.iter().find(|i| i.up && i.multicast) {
        return MulticastInterface::Index {
            name: iface.name.clone(),
            index: iface.index,
        };
    }

    MulticastInterface::Default
}

/// Interfaces as reported by `getifaddrs`, one entry per name (an
/// interface shows up once per address family)
#[cfg(unix)]
pub fn list_interfaces() -> io::Result<Vec<InterfaceInfo>> {
    use std::ffi::CStr;

    let mut interfaces: BTreeMap<String, InterfaceInfo> = BTreeMap::new();
    let mut ifaddrs: *mut libc::ifaddrs = std::ptr::null_mut();

    // SAFETY: getifaddrs populates `ifaddrs` with a list that stays
    // valid until freeifaddrs below
    let ret = unsafe { libc::getifaddrs(&mut ifaddrs) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }

    let mut ifa = ifaddrs;
    while !ifa.is_null() {
        // SAFETY: non-null entry from the getifaddrs list
        let entry = unsafe { &*ifa };
        // SAFETY: ifa_name is a NUL terminated string owned by the list
        let name = unsafe { CStr::from_ptr(entry.ifa_name) };
        let flags = entry.ifa_flags;

        let info = interfaces
            .entry(name.to_string_lossy().into_owned())
            .or_insert_with(|| InterfaceInfo {
                name: name.to_string_lossy().into_owned(),
                // SAFETY: same NUL terminated name
                index: unsafe { libc::if_nametoindex(name.as_ptr()) },
                up: flags & libc::IFF_UP as libc::c_uint != 0,
                multicast: flags & libc::IFF_MULTICAST as libc::c_uint != 0,
                loopback: flags & libc::IFF_LOOPBACK as libc::c_uint != 0,
                ipv4: None,
            });

        if info.ipv4.is_none() && !entry.ifa_addr.is_null() {
            // SAFETY: checked non-null, valid until freeifaddrs
            let family = unsafe { (*entry.ifa_addr).sa_family };
            if i32::from(family) == libc::AF_INET {
                let sin = entry.ifa_addr as *const libc::sockaddr_in;
                // SAFETY: AF_INET means the sockaddr is a sockaddr_in
                let raw = unsafe { (*sin).sin_addr.s_addr };
                info.ipv4 = Some(Ipv4Addr::from(u32::from_be(raw)));
            }
        }

        ifa = entry.ifa_next;
    }

    // SAFETY: the list returned by getifaddrs above, freed once
    unsafe { libc::freeifaddrs(ifaddrs) };

    Ok(interfaces.into_values().collect())
}

#[cfg(not(unix))]
pub fn list_interfaces() -> io::Result<Vec<InterfaceInfo>> {
    Ok(Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(name: &str, up: bool, multicast: bool, loopback: bool, ip: Option<[u8; 4]>) -> InterfaceInfo {
        InterfaceInfo {
            name: name.to_string(),
            index: name.len() as u32,
            up,
            multicast,
            loopback,
            ipv4: ip.map(Ipv4Addr::from),
        }
    }

    #[test]
    fn prefers_non_loopback_with_address() {
        let list = vec![
            iface("lo", true, true, true, Some([127, 0, 0, 1])),
            iface("wlan0", false, true, false, Some([10, 0, 0, 3])),
            iface("eth0", true, true, false, Some([192, 168, 50, 10])),
        ];
        assert_eq!(
            select_interface(&list),
            MulticastInterface::Addr {
                name: "eth0".to_string(),
                addr: Ipv4Addr::new(192, 168, 50, 10)
            }
        );
    }

    #[test]
    fn falls_back_to_index_then_default() {
        let list = vec![
            iface("lo", true, true, true, Some([127, 0, 0, 1])),
            iface("br0", true, true, false, None),
        ];
        assert_eq!(
            select_interface(&list),
            MulticastInterface::Index {
                name: "lo".to_string(),
                index: 2
            }
        );

        let list = vec![iface("eth0", true, false, false, Some([10, 0, 0, 2]))];
        assert_eq!(select_interface(&list), MulticastInterface::Default);
        assert_eq!(select_interface(&[]).membership_addr(), Ipv4Addr::UNSPECIFIED);
    }

    #[cfg(unix)]
    #[test]
    fn lists_interfaces_once_per_name() {
        let list = list_interfaces().expect("getifaddrs");
        let mut names = list.iter().map(|i| i.name.clone()).collect::<Vec<_>>();
        names.dedup();
        assert_eq!(names.len(), list.len());
    }
}
