// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Root passwords for newly created disks

use rand::Rng;
use rand::seq::SliceRandom;
use secrecy::SecretString;

/// Length of generated root passwords.
pub const ROOT_PASSWORD_LENGTH: usize = 64;

const LOWERCASE: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const UPPERCASE: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DIGITS: &[u8] = b"0123456789";
const SYMBOLS: &[u8] = b"!#$%&()*+,-.:;<=>?@[]^_{|}~";

const CLASSES: [&[u8]; 4] = [LOWERCASE, UPPERCASE, DIGITS, SYMBOLS];

/// A randomly generated root password
///
/// The provider requires at least two of the four character classes
/// (lowercase, uppercase, digits, symbols); generated passwords always
/// contain all four.
//
// Like any secret, this deliberately can't be printed.
pub struct RootPassword(SecretString);

impl RootPassword {
    pub fn generate() -> RootPassword {
        Self::generate_with(&mut rand::thread_rng())
    }

    fn generate_with<R: Rng + ?Sized>(rng: &mut R) -> RootPassword {
        let alphabet: Vec<u8> = CLASSES.concat();

        // One character from each class, then fill from the whole alphabet
        // and shuffle so the guaranteed characters aren't always up front.
        let mut chars: Vec<u8> = CLASSES
            .iter()
            .map(|class| class[rng.gen_range(0..class.len())])
            .collect();
        while chars.len() < ROOT_PASSWORD_LENGTH {
            chars.push(alphabet[rng.gen_range(0..alphabet.len())]);
        }
        chars.shuffle(rng);

        let password: String = chars.into_iter().map(char::from).collect();
        RootPassword(SecretString::from(password))
    }

    pub fn secret(&self) -> &SecretString {
        &self.0
    }
}

impl std::fmt::Debug for RootPassword {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RootPassword(<redacted>)")
    }
}
