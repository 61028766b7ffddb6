//! Raw HID devices.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;

use nix::{ioctl_read, ioctl_read_buf, ioctl_readwrite_buf};

use crate::config::{match_string, InputDecl};
use crate::constants::{HIDRAW_READ_MAX, HID_REPORT_MAX};
use crate::input::manager;
use crate::input::{AttachError, BackendHandle, InputCtx, SinkHaptics};
use crate::runtime::reactor::{Owner, Readiness};
use crate::runtime::Rt;
use crate::script;

const HIDRAW_IOC_MAGIC: u8 = b'H';
const HID_MAX_DESCRIPTOR_SIZE: usize = 4096;

#[repr(C)]
pub struct HidrawDevInfo {
    pub bustype: u32,
    pub vendor: i16,
    pub product: i16,
}

#[repr(C)]
pub struct HidrawReportDescriptor {
    pub size: u32,
    pub value: [u8; HID_MAX_DESCRIPTOR_SIZE],
}

ioctl_read!(hidraw_desc_size, HIDRAW_IOC_MAGIC, 0x01, libc::c_int);
ioctl_read!(hidraw_descriptor, HIDRAW_IOC_MAGIC, 0x02, HidrawReportDescriptor);
ioctl_read!(hidraw_devinfo, HIDRAW_IOC_MAGIC, 0x03, HidrawDevInfo);
ioctl_read_buf!(hidraw_name, HIDRAW_IOC_MAGIC, 0x04, u8);
ioctl_read_buf!(hidraw_phys, HIDRAW_IOC_MAGIC, 0x05, u8);
ioctl_readwrite_buf!(hidraw_set_feature, HIDRAW_IOC_MAGIC, 0x06, u8);
ioctl_readwrite_buf!(hidraw_get_feature, HIDRAW_IOC_MAGIC, 0x07, u8);
ioctl_read_buf!(hidraw_uniq, HIDRAW_IOC_MAGIC, 0x08, u8);

fn read_string_ioctl(
    fd: RawFd,
    op: unsafe fn(libc::c_int, &mut [u8]) -> nix::Result<libc::c_int>,
) -> Option<String> {
    let mut buf = [0u8; 256];
    unsafe { op(fd, &mut buf) }.ok()?;
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    Some(String::from_utf8_lossy(&buf[..end]).to_string())
}

/// Parses the udev `ID_USB_INTERFACE_NUM` property (a hex string like "01").
pub fn parse_interface_number(prop: Option<&str>) -> i32 {
    prop.and_then(|s| i32::from_str_radix(s.trim(), 16).ok())
        .unwrap_or(-1)
}

/// Enumerates hidraw nodes and returns the first whose raw info, strings
/// and USB interface number satisfy the declaration.
pub fn match_device(decl: &InputDecl) -> Option<String> {
    crate::udev::enumerate_and_match("hidraw", |dev| {
        let devnode = dev.devnode()?.to_string_lossy().to_string();
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&devnode)
            .ok()?;
        let fd = file.as_raw_fd();

        let mut info = HidrawDevInfo {
            bustype: 0,
            vendor: 0,
            product: 0,
        };
        unsafe { hidraw_devinfo(fd, &mut info) }.ok()?;

        if let Some(bus) = decl.bus {
            if bus.bustype() as u32 != info.bustype {
                return None;
            }
        }
        if decl.vendor != 0 && decl.vendor != info.vendor as u16 {
            return None;
        }
        if decl.product != 0 && decl.product != info.product as u16 {
            return None;
        }

        if !decl.name.is_empty() {
            let name = read_string_ioctl(fd, hidraw_name)?;
            if !match_string(&decl.name, &name) {
                return None;
            }
        }
        if !decl.phys.is_empty() {
            if let Some(phys) = read_string_ioctl(fd, hidraw_phys) {
                if !match_string(&decl.phys, &phys) {
                    return None;
                }
            }
        }
        if !decl.uniq.is_empty() {
            if let Some(uniq) = read_string_ioctl(fd, hidraw_uniq) {
                if !match_string(&decl.uniq, &uniq) {
                    return None;
                }
            }
        }

        if decl.interface >= 0 {
            let prop = dev
                .property_value("ID_USB_INTERFACE_NUM")
                .map(|v| v.to_string_lossy().to_string());
            if parse_interface_number(prop.as_deref()) != decl.interface {
                return None;
            }
        }

        log::info!("matched '{}' -> {devnode}", decl.id);
        Some(devnode)
    })
}

/// Opens the node read-write. The fd stays non-blocking unless the
/// declaration grabs it, which opts into blocking output-report writes.
pub fn attach(rt: &Rt, devnode: &str, decl: InputDecl) -> Result<InputCtx, AttachError> {
    let mut options = OpenOptions::new();
    options.read(true).write(true);
    if !decl.grab {
        options.custom_flags(libc::O_NONBLOCK);
    }
    let file = options.open(devnode)?;

    let fd = file.as_raw_fd();
    rt.state_mut().reactor.register(fd, Owner::Hidraw)?;
    log::info!("attached hidraw '{}' at {devnode}", decl.id);

    Ok(InputCtx {
        decl,
        fd,
        backend: BackendHandle::Hidraw(file),
        active: true,
        grab_pending: false,
        haptics: SinkHaptics::default(),
    })
}

pub fn detach(rt: &Rt, ctx: &mut InputCtx) {
    if ctx.fd >= 0 {
        rt.state_mut().reactor.unregister(ctx.fd);
    }
}

enum ReadOutcome {
    Data(Vec<u8>),
    Disconnect,
    Errno(String),
    Again,
}

/// Reactor callback: one bounded read per wake, one callback per read.
pub fn handle_event(rt: &Rt, fd: RawFd, ready: Readiness) {
    if ready.is_gone() {
        if let Some(decl) = manager::detach_by_fd(rt, fd) {
            script::notify_state(rt, &decl, "remove");
        }
        return;
    }
    if !ready.readable {
        return;
    }

    let (id, on_event, outcome) = {
        let mut state = rt.state_mut();
        let state = &mut *state;
        let Some(id) = state.fd_index.get(&fd).cloned() else {
            return;
        };
        let Some(ctx) = state.input_map.get_mut(&id) else {
            return;
        };
        let BackendHandle::Hidraw(file) = &mut ctx.backend else {
            return;
        };

        let mut buf = vec![0u8; HIDRAW_READ_MAX];
        let outcome = match file.read(&mut buf) {
            Ok(0) => ReadOutcome::Disconnect,
            Ok(n) => {
                buf.truncate(n);
                ReadOutcome::Data(buf)
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => ReadOutcome::Again,
            Err(e) => ReadOutcome::Errno(e.to_string()),
        };
        (id, ctx.decl.on_event.clone(), outcome)
    };

    match outcome {
        ReadOutcome::Again => (),
        ReadOutcome::Data(data) => {
            if !on_event.is_empty() {
                script::call_with_io_event(rt, &on_event, &id, &data, "ok");
            }
        }
        ReadOutcome::Errno(errno) => {
            if !on_event.is_empty() {
                script::call_with_io_event(rt, &on_event, &id, &[], &errno);
            }
        }
        ReadOutcome::Disconnect => {
            if !on_event.is_empty() {
                script::call_with_io_event(rt, &on_event, &id, &[], "disconnect");
            }
            if let Some(decl) = manager::detach_by_fd(rt, fd) {
                script::notify_state(rt, &decl, "remove");
            }
        }
    }
}

fn ctx_fd(rt: &Rt, id: &str) -> Option<RawFd> {
    let state = rt.state();
    let ctx = state.input_map.get(id)?;
    if ctx.fd < 0 {
        None
    } else {
        Some(ctx.fd)
    }
}

/// HIDIOCGFEATURE. The first byte of the returned report is the report id.
pub fn get_feature_report(rt: &Rt, id: &str, report_id: u8) -> Option<Vec<u8>> {
    let fd = ctx_fd(rt, id)?;
    let mut buf = vec![0u8; HID_REPORT_MAX];
    buf[0] = report_id;
    unsafe { hidraw_get_feature(fd, &mut buf) }.ok()?;
    Some(buf)
}

/// HIDIOCSFEATURE.
pub fn send_feature_report(rt: &Rt, id: &str, data: &[u8]) -> bool {
    let Some(fd) = ctx_fd(rt, id) else {
        return false;
    };
    let mut buf = data.to_vec();
    unsafe { hidraw_set_feature(fd, &mut buf) }.is_ok()
}

/// HIDIOCGRDESCSIZE + HIDIOCGRDESC.
pub fn get_report_descriptor(rt: &Rt, id: &str) -> Option<Vec<u8>> {
    let fd = ctx_fd(rt, id)?;

    let mut size: libc::c_int = 0;
    unsafe { hidraw_desc_size(fd, &mut size) }.ok()?;
    let size = size.clamp(0, HID_MAX_DESCRIPTOR_SIZE as i32) as usize;

    let mut desc = HidrawReportDescriptor {
        size: size as u32,
        value: [0; HID_MAX_DESCRIPTOR_SIZE],
    };
    unsafe { hidraw_descriptor(fd, &mut desc) }.ok()?;
    Some(desc.value[..size].to_vec())
}

/// One direct read from the hidraw fd, outside the event path.
pub fn read_input_report(rt: &Rt, id: &str) -> Option<Vec<u8>> {
    let mut state = rt.state_mut();
    let ctx = state.input_map.get_mut(id)?;
    let BackendHandle::Hidraw(file) = &mut ctx.backend else {
        return None;
    };
    let mut buf = vec![0u8; HID_REPORT_MAX];
    match file.read(&mut buf) {
        Ok(n) if n > 0 => {
            buf.truncate(n);
            Some(buf)
        }
        _ => None,
    }
}

/// Writes an output report. Blocking when the device was opened with
/// `grab`, best-effort otherwise.
pub fn send_output_report(rt: &Rt, id: &str, data: &[u8]) -> bool {
    let mut state = rt.state_mut();
    let Some(ctx) = state.input_map.get_mut(id) else {
        return false;
    };
    let BackendHandle::Hidraw(file) = &mut ctx.backend else {
        return false;
    };
    match file.write(data) {
        Ok(n) => n == data.len(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interface_number_parses_hex() {
        assert_eq!(parse_interface_number(Some("01")), 1);
        assert_eq!(parse_interface_number(Some("0a")), 10);
        assert_eq!(parse_interface_number(Some("10")), 16);
        assert_eq!(parse_interface_number(Some(" 02\n")), 2);
    }

    #[test]
    fn interface_number_missing_or_bad_is_wildcard() {
        assert_eq!(parse_interface_number(None), -1);
        assert_eq!(parse_interface_number(Some("zz")), -1);
        assert_eq!(parse_interface_number(Some("")), -1);
    }
}
