//! The Windows registry and process creation.
//!
//! Reads and deletes go through the `registry` crate. Change notification and
//! process creation need raw handles and use the `windows` crate directly.

use std::sync::Arc;

use log::{trace, warn};
use registry::{self as reg, Data, RegKey, Security};
use windows::core::{PCWSTR, PWSTR};
use windows::Win32::Foundation::{
    CloseHandle, BOOL, ERROR_FILE_NOT_FOUND, ERROR_SUCCESS, HANDLE, WAIT_OBJECT_0, WIN32_ERROR,
};
use windows::Win32::System::Registry::{
    RegCloseKey, RegNotifyChangeKeyValue, RegOpenKeyExW, HKEY, HKEY_CLASSES_ROOT,
    HKEY_CURRENT_USER, HKEY_LOCAL_MACHINE, HKEY_USERS, KEY_NOTIFY, REG_NOTIFY_FILTER,
};
use windows::Win32::System::Threading::{
    CreateEventW, CreateProcessW, SetEvent, WaitForMultipleObjects,
    INFINITE, PROCESS_CREATION_FLAGS, PROCESS_INFORMATION, STARTF_USESHOWWINDOW, STARTUPINFOW,
};
use windows::Win32::UI::WindowsAndMessaging::SW_SHOWNORMAL;

use crate::keys::{Hive, KeyPath, KeyRead, RegistryError, RegistryRead, RegistryWrite};
use crate::launch::{LaunchError, Launcher};
use crate::watch::{NotifyFilter, NotifySource, RegistryWatch, StopSignal, WatchError, WatchScope, Wakeup};

trait ToWide {
    fn to_wide_null(&self) -> Vec<u16>;
}

impl ToWide for str {
    fn to_wide_null(&self) -> Vec<u16> {
        self.encode_utf16().chain(Some(0)).collect()
    }
}

fn os_message(status: WIN32_ERROR) -> String {
    std::io::Error::from_raw_os_error(status.0 as i32).to_string()
}

fn reg_hive(hive: Hive) -> reg::Hive {
    match hive {
        Hive::ClassesRoot => reg::Hive::ClassesRoot,
        Hive::CurrentUser => reg::Hive::CurrentUser,
        Hive::LocalMachine => reg::Hive::LocalMachine,
        Hive::Users => reg::Hive::Users,
    }
}

fn predefined_key(hive: Hive) -> HKEY {
    match hive {
        Hive::ClassesRoot => HKEY_CLASSES_ROOT,
        Hive::CurrentUser => HKEY_CURRENT_USER,
        Hive::LocalMachine => HKEY_LOCAL_MACHINE,
        Hive::Users => HKEY_USERS,
    }
}

fn key_error(path: &KeyPath, e: reg::key::Error) -> RegistryError {
    match e {
        reg::key::Error::NotFound(..) => RegistryError::NotFound(path.clone()),
        reg::key::Error::PermissionDenied(..) => RegistryError::AccessDenied(path.clone()),
        e => RegistryError::Os {
            path: path.clone(),
            message: e.to_string(),
        },
    }
}

/// The live registry of this machine and user.
#[derive(Debug, Default, Clone, Copy)]
pub struct WindowsRegistry;

pub struct WindowsKey {
    key: RegKey,
    path: KeyPath,
}

impl RegistryRead for WindowsRegistry {
    type Key = WindowsKey;

    fn open_key(&self, key: &KeyPath) -> Result<WindowsKey, RegistryError> {
        let opened = reg_hive(key.hive)
            .open(key.path.as_str(), Security::Read)
            .map_err(|e| key_error(key, e))?;
        Ok(WindowsKey {
            key: opened,
            path: key.clone(),
        })
    }
}

impl KeyRead for WindowsKey {
    fn key_path(&self) -> &KeyPath {
        &self.path
    }

    fn subkey_names(&self) -> Result<Vec<String>, RegistryError> {
        Ok(self
            .key
            .keys()
            .filter_map(|k| k.ok())
            .map(|k| k.to_string())
            .collect())
    }

    fn open_subkey(&self, name: &str) -> Result<WindowsKey, RegistryError> {
        let path = self.path.child(name);
        let key = self
            .key
            .open(name, Security::Read)
            .map_err(|e| key_error(&path, e))?;
        Ok(WindowsKey { key, path })
    }

    fn string_value(&self, name: &str) -> Option<String> {
        match self.key.value(name) {
            Ok(Data::String(data)) | Ok(Data::ExpandString(data)) => Some(data.to_string_lossy()),
            _ => None,
        }
    }
}

impl RegistryWrite for WindowsRegistry {
    fn delete_tree(&self, key: &KeyPath) -> Result<(), RegistryError> {
        let parent_path = key.parent().ok_or_else(|| RegistryError::Os {
            path: key.clone(),
            message: "refusing to delete a hive root".to_string(),
        })?;
        let parent = reg_hive(parent_path.hive)
            .open(parent_path.path.as_str(), Security::AllAccess)
            .map_err(|e| key_error(&parent_path, e))?;

        parent.delete(key.leaf(), true).map_err(|e| key_error(key, e))?;
        trace!("Deleted {}", key);
        Ok(())
    }
}

struct OwnedKey(HKEY);

// A registry handle may be used and closed from any thread.
unsafe impl Send for OwnedKey {}

impl OwnedKey {
    fn open(path: &KeyPath) -> Result<OwnedKey, WIN32_ERROR> {
        let subkey = path.path.to_wide_null();
        let mut hkey = HKEY::default();
        let status = unsafe {
            RegOpenKeyExW(
                predefined_key(path.hive),
                PCWSTR(subkey.as_ptr()),
                0,
                KEY_NOTIFY,
                &mut hkey,
            )
        };
        if status != ERROR_SUCCESS {
            return Err(status);
        }
        Ok(OwnedKey(hkey))
    }
}

impl Drop for OwnedKey {
    fn drop(&mut self) {
        let status = unsafe { RegCloseKey(self.0) };
        if status != ERROR_SUCCESS {
            warn!("RegCloseKey failed: {}", os_message(status));
        }
    }
}

struct OwnedEvent(HANDLE);

unsafe impl Send for OwnedEvent {}
unsafe impl Sync for OwnedEvent {}

impl OwnedEvent {
    fn new(manual_reset: bool) -> windows::core::Result<OwnedEvent> {
        let handle = unsafe {
            CreateEventW(None, BOOL::from(manual_reset), BOOL::from(false), PCWSTR::null())?
        };
        Ok(OwnedEvent(handle))
    }
}

impl Drop for OwnedEvent {
    fn drop(&mut self) {
        if let Err(e) = unsafe { CloseHandle(self.0) } {
            warn!("CloseHandle failed: {}", e);
        }
    }
}

pub struct WindowsStop {
    event: Arc<OwnedEvent>,
}

impl StopSignal for WindowsStop {
    fn signal(&self) {
        if let Err(e) = unsafe { SetEvent(self.event.0) } {
            warn!("Cannot signal watcher stop: {}", e);
        }
    }
}

/// A key opened with notify rights, an auto-reset event the subscription
/// signals, and a manual-reset stop event.
pub struct WindowsNotifySource {
    key: OwnedKey,
    path: KeyPath,
    notify: OwnedEvent,
    stop: Arc<OwnedEvent>,
}

impl RegistryWatch for WindowsRegistry {
    type Source = WindowsNotifySource;

    fn notify_source(&self, key: &KeyPath) -> Result<WindowsNotifySource, RegistryError> {
        let handle = OwnedKey::open(key).map_err(|status| match status {
            ERROR_FILE_NOT_FOUND => RegistryError::NotFound(key.clone()),
            status => RegistryError::Os {
                path: key.clone(),
                message: os_message(status),
            },
        })?;
        let event = |e: windows::core::Error| RegistryError::Os {
            path: key.clone(),
            message: e.message().to_string(),
        };

        Ok(WindowsNotifySource {
            key: handle,
            path: key.clone(),
            notify: OwnedEvent::new(false).map_err(event)?,
            stop: Arc::new(OwnedEvent::new(true).map_err(event)?),
        })
    }
}

impl NotifySource for WindowsNotifySource {
    type Stop = WindowsStop;

    fn stop_handle(&self) -> WindowsStop {
        WindowsStop {
            event: Arc::clone(&self.stop),
        }
    }

    fn subscribe(&mut self, filter: NotifyFilter, scope: WatchScope) -> Result<(), WatchError> {
        let status = unsafe {
            RegNotifyChangeKeyValue(
                self.key.0,
                BOOL::from(scope == WatchScope::KeyAndSubtree),
                REG_NOTIFY_FILTER(filter.bits()),
                self.notify.0,
                BOOL::from(true),
            )
        };
        if status != ERROR_SUCCESS {
            return Err(WatchError::Subscribe { status: status.0 });
        }
        Ok(())
    }

    fn wait(&mut self) -> Result<Wakeup, WatchError> {
        // The stop event comes first so it wins when both are signalled.
        let handles = [self.stop.0, self.notify.0];
        let result = unsafe { WaitForMultipleObjects(&handles, BOOL::from(false), INFINITE) };

        if result == WAIT_OBJECT_0 {
            Ok(Wakeup::Stop)
        } else if result.0 == WAIT_OBJECT_0.0 + 1 {
            Ok(Wakeup::Changed)
        } else {
            Err(WatchError::Wait {
                message: format!("{} returned {:#x}", self.path, result.0),
            })
        }
    }

    fn key_exists(&self) -> Result<bool, WatchError> {
        match OwnedKey::open(&self.path) {
            Ok(_) => Ok(true),
            Err(ERROR_FILE_NOT_FOUND) => Ok(false),
            Err(status) => Err(WatchError::Existence(RegistryError::Os {
                path: self.path.clone(),
                message: os_message(status),
            })),
        }
    }
}

/// Starts processes with `CreateProcessW` in a normal, visible window.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLauncher;

impl Launcher for ProcessLauncher {
    fn launch(&self, command_line: &str, working_dir: Option<&str>) -> Result<(), LaunchError> {
        if command_line.trim().is_empty() {
            return Err(LaunchError::EmptyCommand);
        }

        let mut command = command_line.to_wide_null();
        let directory = working_dir.filter(|d| !d.is_empty()).map(|d| d.to_wide_null());
        let directory_ptr = directory
            .as_ref()
            .map_or(PCWSTR::null(), |d| PCWSTR(d.as_ptr()));

        let startup = STARTUPINFOW {
            cb: std::mem::size_of::<STARTUPINFOW>() as u32,
            dwFlags: STARTF_USESHOWWINDOW,
            wShowWindow: SW_SHOWNORMAL.0 as u16,
            ..Default::default()
        };
        let mut process = PROCESS_INFORMATION::default();

        unsafe {
            CreateProcessW(
                PCWSTR::null(),
                PWSTR(command.as_mut_ptr()),
                None,
                None,
                BOOL::from(false),
                PROCESS_CREATION_FLAGS(0),
                None,
                directory_ptr,
                &startup,
                &mut process,
            )
        }
        .map_err(|e| LaunchError::Os {
            command: command_line.to_string(),
            message: e.message().to_string(),
        })?;

        trace!("Started process {}", process.dwProcessId);
        unsafe {
            let _ = CloseHandle(process.hThread);
            let _ = CloseHandle(process.hProcess);
        }
        Ok(())
    }
}
