//! Direct USB devices through the user-space USB library.
//!
//! The library's internal fds are forwarded into the reactor by pollfd
//! notifiers; readiness drives one non-blocking iteration of its event
//! machinery, which in turn completes asynchronous transfers on the
//! reactor thread. Notifier callbacks only append to a side queue so they
//! can fire while the registry is borrowed.

use std::os::fd::RawFd;

use rusb::ffi::{self, constants};
use rusb::UsbContext;

use crate::config::InputDecl;
use crate::input::manager;
use crate::input::{AttachError, BackendHandle, InputCtx, SinkHaptics};
use crate::runtime::reactor::{Owner, Readiness};
use crate::runtime::{Rt, State};
use crate::script;

#[derive(Default)]
pub struct UsbState {
    pub context: Option<rusb::Context>,
    notifier_data: Option<*mut libc::c_void>,
}

/// An attached USB device: the open handle plus its in-flight asynchronous
/// transfers.
pub struct UsbHandle {
    pub handle: rusb::DeviceHandle<rusb::Context>,
    pub transfers: Vec<*mut ffi::libusb_transfer>,
}

/// Queued pollfd notifier event, applied between library calls.
#[derive(Debug, Clone, Copy)]
pub struct UsbFdEvent {
    pub fd: RawFd,
    pub writable: bool,
    pub add: bool,
}

struct TransferData {
    rt: Rt,
    device: String,
    buffer: Vec<u8>,
}

pub fn transfer_type_name(ty: u8) -> &'static str {
    match ty {
        constants::LIBUSB_TRANSFER_TYPE_CONTROL => "control",
        constants::LIBUSB_TRANSFER_TYPE_ISOCHRONOUS => "iso",
        constants::LIBUSB_TRANSFER_TYPE_BULK => "bulk",
        constants::LIBUSB_TRANSFER_TYPE_INTERRUPT => "interrupt",
        _ => "unknown",
    }
}

pub fn transfer_type_from_str(name: &str) -> u8 {
    match name {
        "bulk" => constants::LIBUSB_TRANSFER_TYPE_BULK,
        "control" => constants::LIBUSB_TRANSFER_TYPE_CONTROL,
        "iso" => constants::LIBUSB_TRANSFER_TYPE_ISOCHRONOUS,
        _ => constants::LIBUSB_TRANSFER_TYPE_INTERRUPT,
    }
}

pub fn transfer_status_name(status: i32) -> &'static str {
    match status {
        constants::LIBUSB_TRANSFER_COMPLETED => "ok",
        constants::LIBUSB_TRANSFER_ERROR => "error",
        constants::LIBUSB_TRANSFER_TIMED_OUT => "timeout",
        constants::LIBUSB_TRANSFER_CANCELLED => "cancelled",
        constants::LIBUSB_TRANSFER_STALL => "stall",
        constants::LIBUSB_TRANSFER_NO_DEVICE => "no_device",
        constants::LIBUSB_TRANSFER_OVERFLOW => "overflow",
        _ => "unknown",
    }
}

extern "system" fn on_fd_added(fd: libc::c_int, events: libc::c_short, user_data: *mut libc::c_void) {
    let rt = unsafe { &*(user_data as *const Rt) };
    rt.push_usb_fd_event(UsbFdEvent {
        fd,
        writable: events & libc::POLLOUT != 0,
        add: true,
    });
}

extern "system" fn on_fd_removed(fd: libc::c_int, user_data: *mut libc::c_void) {
    let rt = unsafe { &*(user_data as *const Rt) };
    rt.push_usb_fd_event(UsbFdEvent {
        fd,
        writable: false,
        add: false,
    });
}

/// Applies queued pollfd changes to the reactor.
pub fn flush_fd_events(rt: &Rt) {
    for ev in rt.take_usb_fd_events() {
        let mut state = rt.state_mut();
        if ev.add {
            let result = if ev.writable {
                state.reactor.register_rw(ev.fd, Owner::Usb)
            } else {
                state.reactor.register(ev.fd, Owner::Usb)
            };
            if let Err(e) = result {
                log::debug!("register usb fd {}: {e}", ev.fd);
            }
        } else {
            state.reactor.unregister(ev.fd);
        }
    }
}

/// Initializes the USB library once, installs the pollfd notifiers, and
/// registers the library's current fd set.
pub fn ensure_context(rt: &Rt) -> Result<(), AttachError> {
    if rt.state().usb.context.is_some() {
        return Ok(());
    }

    let context = rusb::Context::new()?;
    let raw = context.as_raw();

    let user_data = Box::into_raw(Box::new(rt.clone())) as *mut libc::c_void;
    unsafe {
        ffi::libusb_set_pollfd_notifiers(
            raw,
            Some(on_fd_added),
            Some(on_fd_removed),
            user_data,
        );

        // Fds created before the notifiers were installed.
        let pollfds = ffi::libusb_get_pollfds(raw);
        if !pollfds.is_null() {
            let mut cursor = pollfds;
            while !(*cursor).is_null() {
                let fd = (**cursor).fd;
                let events = (**cursor).events;
                rt.push_usb_fd_event(UsbFdEvent {
                    fd,
                    writable: events & libc::POLLOUT != 0,
                    add: true,
                });
                cursor = cursor.add(1);
            }
            ffi::libusb_free_pollfds(pollfds);
        }
    }

    {
        let mut state = rt.state_mut();
        state.usb.context = Some(context);
        state.usb.notifier_data = Some(user_data);
    }
    flush_fd_events(rt);
    log::debug!("usb library initialized");
    Ok(())
}

pub fn teardown(state: &mut State) {
    if let Some(context) = state.usb.context.take() {
        unsafe {
            ffi::libusb_set_pollfd_notifiers(
                context.as_raw(),
                None,
                None,
                std::ptr::null_mut(),
            );
        }
    }
    if let Some(data) = state.usb.notifier_data.take() {
        drop(unsafe { Box::from_raw(data as *mut Rt) });
    }
}

fn hex_attr(dev: &udev::Device, name: &str) -> Option<u16> {
    let value = dev.attribute_value(name)?.to_string_lossy().to_string();
    u16::from_str_radix(value.trim(), 16).ok()
}

/// Enumerates the usb subsystem and resolves the declaration to a syspath.
pub fn match_device(decl: &InputDecl) -> Option<String> {
    if decl.vendor == 0 && decl.product == 0 && decl.name.is_empty() {
        return None;
    }

    crate::udev::enumerate_and_match("usb", |dev| {
        if dev.devtype().map(|t| t.to_string_lossy().to_string()) != Some("usb_device".into()) {
            return None;
        }
        if decl.vendor != 0 && hex_attr(dev, "idVendor") != Some(decl.vendor) {
            return None;
        }
        if decl.product != 0 && hex_attr(dev, "idProduct") != Some(decl.product) {
            return None;
        }
        if !decl.name.is_empty() {
            let product = dev
                .attribute_value("product")
                .map(|v| v.to_string_lossy().to_string())
                .unwrap_or_default();
            if !crate::config::match_string(&decl.name, &product) {
                return None;
            }
        }
        let syspath = dev.syspath().to_string_lossy().to_string();
        log::info!("matched '{}' -> {syspath}", decl.id);
        Some(syspath)
    })
}

/// Opens the device by vendor/product, detaches the kernel driver and
/// claims the declared interface.
pub fn attach(rt: &Rt, _devnode: &str, decl: InputDecl) -> Result<InputCtx, AttachError> {
    ensure_context(rt)?;

    let handle = {
        let state = rt.state();
        let context = state
            .usb
            .context
            .as_ref()
            .ok_or_else(|| AttachError::Failed("usb library not initialized".into()))?;
        context
            .open_device_with_vid_pid(decl.vendor, decl.product)
            .ok_or(AttachError::Usb(rusb::Error::NoDevice))?
    };

    if let Err(e) = handle.set_auto_detach_kernel_driver(true) {
        log::debug!("auto-detach kernel driver: {e}");
    }
    let interface = if decl.interface >= 0 {
        decl.interface as u8
    } else {
        0
    };
    handle.claim_interface(interface)?;

    flush_fd_events(rt);
    log::info!(
        "attached usb '{}' ({:04x}:{:04x})",
        decl.id,
        decl.vendor,
        decl.product
    );

    Ok(InputCtx {
        decl,
        fd: -1,
        backend: BackendHandle::Usb(UsbHandle {
            handle,
            transfers: Vec::new(),
        }),
        active: true,
        grab_pending: false,
        haptics: SinkHaptics::default(),
    })
}

/// Cancels in-flight transfers and pumps the event machinery so their
/// callbacks reap them before the handle closes.
pub fn detach(rt: &Rt, ctx: &mut InputCtx) {
    let BackendHandle::Usb(usb) = &mut ctx.backend else {
        return;
    };

    let transfers = std::mem::take(&mut usb.transfers);
    for &transfer in &transfers {
        unsafe {
            ffi::libusb_cancel_transfer(transfer);
        }
    }

    if !transfers.is_empty() {
        let raw = rt.state().usb.context.as_ref().map(|c| c.as_raw());
        if let Some(raw) = raw {
            let tv = libc::timeval {
                tv_sec: 0,
                tv_usec: 100_000,
            };
            unsafe {
                ffi::libusb_handle_events_timeout_completed(raw, &tv, std::ptr::null_mut());
            }
        }
    }
    flush_fd_events(rt);
}

/// Reactor callback for any library-owned fd: one zero-timeout iteration.
pub fn handle_event(rt: &Rt, _fd: RawFd, _ready: Readiness) {
    let raw = rt.state().usb.context.as_ref().map(|c| c.as_raw());
    let Some(raw) = raw else {
        return;
    };
    let tv = libc::timeval {
        tv_sec: 0,
        tv_usec: 0,
    };
    unsafe {
        ffi::libusb_handle_events_timeout_completed(raw, &tv, std::ptr::null_mut());
    }
    flush_fd_events(rt);
}

fn raw_handle(rt: &Rt, id: &str) -> Option<*mut ffi::libusb_device_handle> {
    let state = rt.state();
    let ctx = state.input_map.get(id)?;
    match &ctx.backend {
        BackendHandle::Usb(usb) => Some(usb.handle.as_raw()),
        _ => None,
    }
}

pub struct SyncResult {
    pub data: Vec<u8>,
    pub size: i32,
    pub status: i32,
}

fn no_device() -> SyncResult {
    SyncResult {
        data: Vec::new(),
        size: 0,
        status: constants::LIBUSB_ERROR_NO_DEVICE,
    }
}

/// Synchronous bulk transfer. IN reads up to `size` bytes; OUT sends
/// `data` (clamped to `size`) and echoes the transmitted bytes back.
pub fn bulk_transfer(
    rt: &Rt,
    id: &str,
    endpoint: u8,
    size: usize,
    data: Option<Vec<u8>>,
    timeout_ms: u32,
) -> SyncResult {
    let Some(handle) = raw_handle(rt, id) else {
        return no_device();
    };

    let is_in = endpoint & constants::LIBUSB_ENDPOINT_IN != 0;
    let mut transferred: libc::c_int = 0;

    if is_in {
        let mut buf = vec![0u8; size];
        let status = unsafe {
            ffi::libusb_bulk_transfer(
                handle,
                endpoint,
                buf.as_mut_ptr(),
                size as libc::c_int,
                &mut transferred,
                timeout_ms,
            )
        };
        buf.truncate(transferred.max(0) as usize);
        SyncResult {
            data: buf,
            size: transferred,
            status,
        }
    } else {
        let mut out = data.unwrap_or_default();
        out.truncate(size);
        let status = unsafe {
            ffi::libusb_bulk_transfer(
                handle,
                endpoint,
                out.as_mut_ptr(),
                out.len() as libc::c_int,
                &mut transferred,
                timeout_ms,
            )
        };
        out.truncate(transferred.max(0) as usize);
        SyncResult {
            data: out,
            size: transferred,
            status,
        }
    }
}

/// Synchronous interrupt transfer, with the bulk-transfer semantics.
pub fn interrupt_transfer(
    rt: &Rt,
    id: &str,
    endpoint: u8,
    size: usize,
    data: Option<Vec<u8>>,
    timeout_ms: u32,
) -> SyncResult {
    let Some(handle) = raw_handle(rt, id) else {
        return no_device();
    };

    let is_in = endpoint & constants::LIBUSB_ENDPOINT_IN != 0;
    let mut transferred: libc::c_int = 0;

    if is_in {
        let mut buf = vec![0u8; size];
        let status = unsafe {
            ffi::libusb_interrupt_transfer(
                handle,
                endpoint,
                buf.as_mut_ptr(),
                size as libc::c_int,
                &mut transferred,
                timeout_ms,
            )
        };
        buf.truncate(transferred.max(0) as usize);
        SyncResult {
            data: buf,
            size: transferred,
            status,
        }
    } else {
        let mut out = data.unwrap_or_default();
        out.truncate(size);
        let status = unsafe {
            ffi::libusb_interrupt_transfer(
                handle,
                endpoint,
                out.as_mut_ptr(),
                out.len() as libc::c_int,
                &mut transferred,
                timeout_ms,
            )
        };
        out.truncate(transferred.max(0) as usize);
        SyncResult {
            data: out,
            size: transferred,
            status,
        }
    }
}

/// Synchronous control transfer. The returned status is the library's
/// byte count (>= 0) or error code. OUT returns an empty payload.
#[allow(clippy::too_many_arguments)]
pub fn control_transfer(
    rt: &Rt,
    id: &str,
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    length: u16,
    data: Option<Vec<u8>>,
    timeout_ms: u32,
) -> SyncResult {
    let Some(handle) = raw_handle(rt, id) else {
        return no_device();
    };

    let is_in = request_type & constants::LIBUSB_ENDPOINT_IN != 0;

    if is_in {
        let mut buf = vec![0u8; length as usize];
        let status = unsafe {
            ffi::libusb_control_transfer(
                handle,
                request_type,
                request,
                value,
                index,
                buf.as_mut_ptr(),
                length,
                timeout_ms,
            )
        };
        let n = status.max(0) as usize;
        buf.truncate(n);
        SyncResult {
            data: buf,
            size: status.max(0),
            status,
        }
    } else {
        let mut out = data.unwrap_or_default();
        out.truncate(length as usize);
        let status = unsafe {
            ffi::libusb_control_transfer(
                handle,
                request_type,
                request,
                value,
                index,
                out.as_mut_ptr(),
                out.len() as u16,
                timeout_ms,
            )
        };
        SyncResult {
            data: Vec::new(),
            size: status.max(0),
            status,
        }
    }
}

/// Submits an asynchronous transfer. Returns the transfer handle (an
/// opaque pointer value) on success, or the library error code.
pub fn submit_transfer(
    rt: &Rt,
    id: &str,
    endpoint: u8,
    transfer_type: u8,
    size: usize,
    timeout_ms: u32,
) -> Result<usize, i32> {
    let Some(handle) = raw_handle(rt, id) else {
        return Err(constants::LIBUSB_ERROR_NO_DEVICE);
    };

    let transfer = unsafe { ffi::libusb_alloc_transfer(0) };
    if transfer.is_null() {
        return Err(constants::LIBUSB_ERROR_NO_MEM);
    }

    let mut data = Box::new(TransferData {
        rt: rt.clone(),
        device: id.to_string(),
        buffer: vec![0u8; size],
    });
    let buffer_ptr = data.buffer.as_mut_ptr();
    let data_ptr = Box::into_raw(data);

    unsafe {
        (*transfer).dev_handle = handle;
        (*transfer).endpoint = endpoint;
        (*transfer).transfer_type = transfer_type;
        (*transfer).timeout = timeout_ms;
        (*transfer).buffer = buffer_ptr;
        (*transfer).length = size as libc::c_int;
        (*transfer).user_data = data_ptr as *mut libc::c_void;
        (*transfer).callback = on_transfer_complete;
    }

    let rc = unsafe { ffi::libusb_submit_transfer(transfer) };
    if rc != 0 {
        log::warn!("submit transfer for '{id}': {rc}");
        unsafe {
            drop(Box::from_raw(data_ptr));
            ffi::libusb_free_transfer(transfer);
        }
        return Err(rc);
    }

    {
        let mut state = rt.state_mut();
        if let Some(ctx) = state.input_map.get_mut(id) {
            if let BackendHandle::Usb(usb) = &mut ctx.backend {
                usb.transfers.push(transfer);
            }
        }
    }
    flush_fd_events(rt);
    Ok(transfer as usize)
}

fn transfer_is_live(rt: &Rt, id: &str, transfer: usize) -> bool {
    let state = rt.state();
    let Some(ctx) = state.input_map.get(id) else {
        return false;
    };
    match &ctx.backend {
        BackendHandle::Usb(usb) => usb
            .transfers
            .contains(&(transfer as *mut ffi::libusb_transfer)),
        _ => false,
    }
}

pub fn cancel_transfer(rt: &Rt, id: &str, transfer: usize) -> bool {
    if !transfer_is_live(rt, id, transfer) {
        return false;
    }
    unsafe { ffi::libusb_cancel_transfer(transfer as *mut ffi::libusb_transfer) == 0 }
}

pub fn resubmit_transfer(rt: &Rt, id: &str, transfer: usize) -> bool {
    if !transfer_is_live(rt, id, transfer) {
        return false;
    }
    unsafe { ffi::libusb_submit_transfer(transfer as *mut ffi::libusb_transfer) == 0 }
}

unsafe fn destroy_transfer(rt: &Rt, device: &str, transfer: *mut ffi::libusb_transfer) {
    {
        let mut state = rt.state_mut();
        if let Some(ctx) = state.input_map.get_mut(device) {
            if let BackendHandle::Usb(usb) = &mut ctx.backend {
                usb.transfers.retain(|&t| t != transfer);
            }
        }
    }
    let data = (*transfer).user_data as *mut TransferData;
    (*transfer).user_data = std::ptr::null_mut();
    if !data.is_null() {
        drop(Box::from_raw(data));
    }
    ffi::libusb_free_transfer(transfer);
}

/// Completion path for asynchronous transfers. Runs on the reactor thread
/// from inside the library's event iteration.
extern "system" fn on_transfer_complete(transfer: *mut ffi::libusb_transfer) {
    unsafe {
        let data = (*transfer).user_data as *mut TransferData;
        if data.is_null() {
            ffi::libusb_free_transfer(transfer);
            return;
        }
        let rt = (*data).rt.clone();
        let device = (*data).device.clone();

        let status = (*transfer).status;
        let endpoint = (*transfer).endpoint;
        let transfer_type = (*transfer).transfer_type;
        let length = (*transfer).actual_length.max(0) as usize;
        let payload = std::slice::from_raw_parts((*transfer).buffer, length).to_vec();

        let (attached, on_event) = {
            let state = rt.state();
            match state.input_map.get(&device) {
                Some(ctx) => (true, ctx.decl.on_event.clone()),
                None => (false, String::new()),
            }
        };

        if attached && !on_event.is_empty() {
            script::call_with_usb_event(
                &rt,
                &on_event,
                &device,
                &payload,
                endpoint,
                transfer_type_name(transfer_type),
                transfer_status_name(status),
            );
        }

        match status {
            constants::LIBUSB_TRANSFER_COMPLETED
            | constants::LIBUSB_TRANSFER_OVERFLOW
            | constants::LIBUSB_TRANSFER_TIMED_OUT
                if attached =>
            {
                if ffi::libusb_submit_transfer(transfer) != 0 {
                    destroy_transfer(&rt, &device, transfer);
                }
            }
            constants::LIBUSB_TRANSFER_NO_DEVICE => {
                destroy_transfer(&rt, &device, transfer);
                if attached {
                    if let Some(decl) = manager::detach(&rt, &device) {
                        script::notify_state(&rt, &decl, "remove");
                    }
                }
            }
            _ => {
                destroy_transfer(&rt, &device, transfer);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_type_names() {
        assert_eq!(
            transfer_type_name(constants::LIBUSB_TRANSFER_TYPE_BULK),
            "bulk"
        );
        assert_eq!(
            transfer_type_name(constants::LIBUSB_TRANSFER_TYPE_INTERRUPT),
            "interrupt"
        );
        assert_eq!(
            transfer_type_name(constants::LIBUSB_TRANSFER_TYPE_CONTROL),
            "control"
        );
        assert_eq!(transfer_type_name(0xff), "unknown");
    }

    #[test]
    fn transfer_status_names() {
        assert_eq!(
            transfer_status_name(constants::LIBUSB_TRANSFER_COMPLETED),
            "ok"
        );
        assert_eq!(
            transfer_status_name(constants::LIBUSB_TRANSFER_NO_DEVICE),
            "no_device"
        );
        assert_eq!(
            transfer_status_name(constants::LIBUSB_TRANSFER_CANCELLED),
            "cancelled"
        );
        assert_eq!(transfer_status_name(-999), "unknown");
    }
}
