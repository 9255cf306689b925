// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! iPXE firmware patching.
//!
//! The firmware images are built with an embedded script that reserves a
//! block between two marker comments. Patching overwrites that block in
//! place so the image keeps its size and checksums outside the block.

use anyhow::{bail, Result};

pub const PLACEHOLDER_START: &[u8] = b"# *PLACEHOLDER START*";
pub const PLACEHOLDER_END: &[u8] = b"# *PLACEHOLDER END*";

/// Attempts at getting a lease and chaining before the machine reboots.
const MAX_ATTEMPTS: u32 = 10;

/// Script that tries `dhcp` on every interface in turn and chains to
/// `next` from the first one that gets a lease.
pub fn chain_script(next: &str) -> String {
    format!(
        r#"
set attempts:int32 0
:retry
iseq ${{attempts}} {MAX_ATTEMPTS} && goto exhausted ||
inc attempts
set idx:int32 0
:ifloop
isset ${{net${{idx}}/mac}} || goto ifdone
dhcp net${{idx}} || goto ifnext
set NEXT {next}
chain --replace ${{NEXT}} || goto ifnext
:ifnext
inc idx
goto ifloop
:ifdone
sleep 1
goto retry
:exhausted
echo boot failed after {MAX_ATTEMPTS} attempts, rebooting
sleep 10
reboot
"#
    )
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Replace the bytes between the placeholder markers of `image` with
/// `script`, padded with newlines to the original block length.
pub fn patch(image: &[u8], script: &str) -> Result<Vec<u8>> {
    let Some(start) = find(image, PLACEHOLDER_START) else {
        bail!("placeholder start marker not found");
    };
    let body_start = start + PLACEHOLDER_START.len();
    let Some(end) = find(&image[body_start..], PLACEHOLDER_END) else {
        bail!("placeholder end marker not found");
    };
    let body_end = body_start + end;

    let capacity = body_end - body_start;
    if script.len() > capacity {
        bail!(
            "script of {} bytes does not fit the {capacity} byte placeholder",
            script.len()
        );
    }

    let mut out = Vec::with_capacity(image.len());
    out.extend_from_slice(&image[..body_start]);
    out.extend_from_slice(script.as_bytes());
    out.resize(body_end, b'\n');
    out.extend_from_slice(&image[body_end..]);
    Ok(out)
}
