// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! Pull numbers out of the free-form text printed by the BMC console.

use crate::Error;

/// The number of hex digits in one i2cdump word.
const HEX_WORD_DIGITS: usize = 4;

/// Extract the first `count` decimal numbers from `text`.
///
/// Anything other than ASCII letters, digits and underscores separates
/// tokens. A token made only of digits is a number; a token mixing in
/// letters, such as `fan1_input`, is a label and contributes nothing.
pub fn extract_numbers(text: &str, count: usize) -> Result<Vec<i64>, Error> {
    let malformed = |found| Error::MalformedResponse {
        expected: count,
        found,
    };
    let mut out = Vec::with_capacity(count);
    for token in text
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|token| !token.is_empty() && token.bytes().all(|b| b.is_ascii_digit()))
    {
        if out.len() == count {
            break;
        }
        let value = token.parse::<i64>().map_err(|_| malformed(out.len()))?;
        out.push(value);
    }
    if out.len() < count {
        return Err(malformed(out.len()));
    }
    Ok(out)
}

/// Extract the first `count` 16-bit words from i2cdump word-mode output.
///
/// A word is a token of exactly four lowercase hex digits. Shorter tokens,
/// such as the row labels, and anything containing other characters are
/// skipped.
pub fn extract_hex_words(text: &str, count: usize) -> Result<Vec<u16>, Error> {
    let is_hex = |c: char| c.is_ascii_digit() || ('a'..='f').contains(&c);
    let out: Vec<u16> = text
        .split(|c: char| !is_hex(c))
        .filter(|token| token.len() == HEX_WORD_DIGITS)
        .filter_map(|token| u16::from_str_radix(token, 16).ok())
        .take(count)
        .collect();
    if out.len() < count {
        return Err(Error::MalformedResponse {
            expected: count,
            found: out.len(),
        });
    }
    Ok(out)
}

/// Remove the echo of `command` from the start of a console response.
///
/// The console echoes what it is sent, so the response usually begins with
/// the command text. If it does not appear, the response is returned as is.
pub fn strip_echo<'a>(response: &'a str, command: &str) -> &'a str {
    let command = command.trim_end();
    match response.find(command) {
        Some(start) => &response[start + command.len()..],
        None => response,
    }
}

#[cfg(test)]
mod tests {
    use super::extract_hex_words;
    use super::extract_numbers;
    use super::strip_echo;
    use crate::Error;

    #[test]
    fn test_extract_numbers() {
        let values = extract_numbers("fan1_input:1234\nfan2_input:0\n", 2);
        assert_eq!(values.unwrap(), vec![1234, 0]);

        // Numbers may be separated by any punctuation.
        assert_eq!(extract_numbers("7500|7650 ", 2).unwrap(), vec![7500, 7650]);
    }

    #[test]
    fn test_extract_numbers_from_sysfs_cat() {
        let text = "\r\n31000\r\n29500\r\n27250\r\nroot@bmc:~# ";
        assert_eq!(
            extract_numbers(text, 3).unwrap(),
            vec![31000, 29500, 27250]
        );
    }

    #[test]
    fn test_extract_numbers_too_few() {
        assert_eq!(
            extract_numbers("1234\n", 2),
            Err(Error::MalformedResponse {
                expected: 2,
                found: 1
            })
        );
        assert!(extract_numbers("", 1).is_err());
        assert_eq!(extract_numbers("", 0).unwrap(), Vec::<i64>::new());
    }

    #[test]
    fn test_extract_hex_words() {
        let text = "     0,8  1,9  2,a  3,b  4,c  5,d  6,e  7,f\r\n\
                    80:                     f8c8 0a12 d3c0 1801\r\n\
                    88: 0064 0000                          \r\n";
        assert_eq!(
            extract_hex_words(text, 6).unwrap(),
            vec![0xf8c8, 0x0a12, 0xd3c0, 0x1801, 0x0064, 0x0000]
        );
        assert!(extract_hex_words(text, 7).is_err());
    }

    #[test]
    fn test_extract_hex_words_skips_uppercase_and_placeholders() {
        let text = "XXXX ABCD 12 12345 beef";
        assert_eq!(extract_hex_words(text, 1).unwrap(), vec![0xbeef]);
    }

    #[test]
    fn test_strip_echo() {
        let cmd = "cat /sys/bus/i2c/devices/8-0033/fan*_input\r\n";
        let response = "cat /sys/bus/i2c/devices/8-0033/fan*_input\r\n7500\r\n";
        assert_eq!(strip_echo(response, cmd), "\r\n7500\r\n");
        assert_eq!(strip_echo("7500\r\n", cmd), "7500\r\n");
    }
}
