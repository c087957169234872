use crate::protocol::mysql::constants::SCRAMBLE_SIZE;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha1::Digest;

/// Generate a random ASCII challenge, avoiding NUL and the separator
/// character, the way mysqld's crypt_genhash does.
/// https://github.com/mysql/mysql-server/blob/8.0/mysys/crypt_genhash_impl.cc#L427
#[inline]
pub fn gen_scramble() -> [u8; SCRAMBLE_SIZE] {
    let mut scramble: [u8; SCRAMBLE_SIZE] = [0; SCRAMBLE_SIZE];
    let mut r = StdRng::from_entropy();
    for item in scramble.iter_mut() {
        let rand = r.gen_range(0..127) as u8;
        *item = rand;
        if *item == b'\0' || *item == b'$' {
            *item += 1;
        }
    }
    scramble
}

pub fn sha1_1(bytes: impl AsRef<[u8]>) -> [u8; 20] {
    sha1::Sha1::digest(bytes).into()
}

pub fn sha1_2(bytes1: impl AsRef<[u8]>, bytes2: impl AsRef<[u8]>) -> [u8; 20] {
    let mut hasher = sha1::Sha1::new();
    hasher.update(bytes1.as_ref());
    hasher.update(bytes2.as_ref());
    hasher.finalize().into()
}

pub fn xor<T, U>(mut left: T, right: U) -> T
where
    T: AsMut<[u8]>,
    U: AsRef<[u8]>,
{
    left.as_mut()
        .iter_mut()
        .zip(right.as_ref().iter())
        .for_each(|(l, r)| *l ^= r);
    left
}

/// What the server stores for a native-password account: `SHA1(SHA1(pwd))`.
pub fn password_hash2(password: &str) -> [u8; 20] {
    sha1_1(sha1_1(password))
}

/// mysql_native_password client proof:
/// `SHA1(pwd) XOR SHA1(challenge ++ SHA1(SHA1(pwd)))`.
/// Empty passwords answer with an empty proof.
pub fn auth_response(challenge: &[u8], password: &str) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let t1 = sha1_1(password);
    let t2 = sha1_1(t1);
    let t3 = sha1_2(challenge, t2);
    xor(t3, t1).to_vec()
}

/// Symmetric verification with only `hash2 = SHA1(SHA1(pwd))` stored:
/// recover the SHA1(pwd) candidate from the proof and hash it once more.
pub fn check_auth(challenge: &[u8], hash2: &[u8; 20], response: &[u8]) -> bool {
    if response.is_empty() {
        return *hash2 == password_hash2("");
    }
    if response.len() != 20 {
        return false;
    }
    let candidate = xor(sha1_2(challenge, hash2), response);
    sha1_1(candidate) == *hash2
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHALLENGE: &[u8] = b"!\"#$%&'()*+,-./01234";

    #[test]
    fn scramble_shape() {
        let scramble = gen_scramble();
        assert_eq!(scramble.len(), SCRAMBLE_SIZE);
        assert!(scramble.iter().all(|&b| b != 0 && b != b'$' && b < 128));
    }

    #[test]
    fn auth_round_trip() {
        let response = auth_response(CHALLENGE, "12345678");
        assert_eq!(response.len(), 20);
        assert!(check_auth(CHALLENGE, &password_hash2("12345678"), &response));
        assert!(!check_auth(CHALLENGE, &password_hash2("bad"), &response));
    }

    #[test]
    fn response_is_challenge_dependent() {
        let r1 = auth_response(CHALLENGE, "12345678");
        let r2 = auth_response(b"00000000000000000000", "12345678");
        assert_ne!(r1, r2);
    }

    #[test]
    fn wrong_length_rejected() {
        assert!(!check_auth(CHALLENGE, &password_hash2("x"), b"short"));
    }

    #[test]
    fn empty_password() {
        assert!(auth_response(CHALLENGE, "").is_empty());
        assert!(check_auth(CHALLENGE, &password_hash2(""), b""));
        assert!(!check_auth(CHALLENGE, &password_hash2("secret"), b""));
    }
}
