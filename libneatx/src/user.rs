// Copyright 2024 Neatx Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Passwd-database lookups, used to resolve a session owner's home
//! directory and login shell for the session store path and the user
//! application step.

use std::ffi::CStr;

use anyhow::{bail, Context};

#[derive(Debug, Clone)]
pub struct Info {
    pub user: String,
    pub uid: u32,
    pub gid: u32,
    pub home_dir: String,
    pub default_shell: String,
}

/// Looks up the passwd entry for the calling process's real uid.
pub fn info() -> anyhow::Result<Info> {
    // Safety: getuid never fails.
    let uid = unsafe { libc::getuid() };
    by_uid(uid)
}

/// Looks up the passwd entry for `username`.
pub fn by_name(username: &str) -> anyhow::Result<Info> {
    let cname = std::ffi::CString::new(username).context("username contains a NUL byte")?;

    let mut buf = vec![0i8; 16 * 1024];
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::passwd = std::ptr::null_mut();

    // Safety: buf outlives the call and is sized well above the typical
    // NSS backend requirement; getpwnam_r never retains pointers after
    // returning.
    let rc = unsafe {
        libc::getpwnam_r(cname.as_ptr(), &mut pwd, buf.as_mut_ptr(), buf.len(), &mut result)
    };
    passwd_from_result(rc, result, &pwd)
}

fn by_uid(uid: u32) -> anyhow::Result<Info> {
    let mut buf = vec![0i8; 16 * 1024];
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::passwd = std::ptr::null_mut();

    // Safety: buf outlives the call and is sized well above the typical
    // NSS backend requirement; getpwuid_r never retains pointers after
    // returning.
    let rc = unsafe {
        libc::getpwuid_r(uid as libc::uid_t, &mut pwd, buf.as_mut_ptr(), buf.len(), &mut result)
    };
    passwd_from_result(rc, result, &pwd)
}

/// Reads the local hostname via `gethostname(2)`, used to stamp new
/// session records (`Session::hostname`, `Session::full_id`).
pub fn hostname() -> anyhow::Result<String> {
    let mut buf = vec![0u8; 256];
    // Safety: buf outlives the call and is sized well above HOST_NAME_MAX
    // on any real system.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        bail!("gethostname failed: {}", std::io::Error::last_os_error());
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
}

fn passwd_from_result(
    rc: i32,
    result: *mut libc::passwd,
    pwd: &libc::passwd,
) -> anyhow::Result<Info> {
    if result.is_null() {
        if rc == 0 {
            bail!("no such user in the passwd database");
        }
        bail!("passwd lookup failed: {}", std::io::Error::from_raw_os_error(rc));
    }

    // Safety: getpwuid_r/getpwnam_r populated these fields on success.
    let user = unsafe { CStr::from_ptr(pwd.pw_name) }.to_string_lossy().into_owned();
    let home_dir = unsafe { CStr::from_ptr(pwd.pw_dir) }.to_string_lossy().into_owned();
    let default_shell = unsafe { CStr::from_ptr(pwd.pw_shell) }.to_string_lossy().into_owned();

    Ok(Info { user, uid: pwd.pw_uid, gid: pwd.pw_gid, home_dir, default_shell })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn current_user_lookup_succeeds() {
        let info = info().expect("passwd lookup for the current uid should succeed");
        assert!(!info.user.is_empty());
        assert!(!info.home_dir.is_empty());
    }

    #[test]
    fn unknown_user_fails() {
        assert!(by_name("this-user-should-not-exist-anywhere-xyz").is_err());
    }

    #[test]
    fn hostname_is_nonempty() {
        assert!(!hostname().unwrap().is_empty());
    }
}
