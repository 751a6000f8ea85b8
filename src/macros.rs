/// Location of the macro invocation, as a [`SourceLocation`](crate::result::SourceLocation).
#[macro_export]
macro_rules! here {
    () => {
        $crate::result::SourceLocation::new(file!(), line!())
    };
}

/// Message prefix of an outcome: the call as written, unless a format string overrides it.
#[doc(hidden)]
#[macro_export]
macro_rules! __kconf_msg {
    ($call: expr) => {
        stringify!($call)
    };
    ($call: expr, $($fmt: tt)+) => {
        format!($($fmt)+)
    };
}

/// Capture `$call` and hand it to the `$helper` outcome helper.
/// The call is evaluated before the reporter is borrowed.
#[doc(hidden)]
#[macro_export]
macro_rules! __kconf_expect {
    ($helper: ident, $ctx: expr, $call: expr, [$($extra: expr),*] $(, $($msg: tt)+)?) => {{
        let call = $crate::expect::capture(|| $call);
        $crate::expect::$helper(
            &$ctx,
            $crate::here!(),
            $crate::__kconf_msg!($call $(, $($msg)+)?),
            call,
            $($extra),*
        )
    }};
}

/// Expect `$call` to return `0`.
///
/// ```ignore
/// expect_pass!(ctx, nix::unistd::close(fd));
/// expect_pass!(ctx, unsafe { libc::mlock(addr, len) }, "mlock({len})");
/// ```
#[macro_export]
macro_rules! expect_pass {
    ($ctx: expr, $call: expr $(, $($msg: tt)+)?) => {
        $crate::__kconf_expect!(pass, $ctx, $call, [] $(, $($msg)+)?)
    };
}

#[macro_export]
macro_rules! expect_pass_silent {
    ($ctx: expr, $call: expr $(, $($msg: tt)+)?) => {
        $crate::__kconf_expect!(pass_silent, $ctx, $call, [] $(, $($msg)+)?)
    };
}

/// Expect `$call` to return a non-negative value.
#[macro_export]
macro_rules! expect_positive {
    ($ctx: expr, $call: expr $(, $($msg: tt)+)?) => {
        $crate::__kconf_expect!(positive, $ctx, $call, [] $(, $($msg)+)?)
    };
}

#[macro_export]
macro_rules! expect_positive_silent {
    ($ctx: expr, $call: expr $(, $($msg: tt)+)?) => {
        $crate::__kconf_expect!(positive_silent, $ctx, $call, [] $(, $($msg)+)?)
    };
}

/// Expect `$call` to return a file descriptor.
#[macro_export]
macro_rules! expect_fd {
    ($ctx: expr, $call: expr $(, $($msg: tt)+)?) => {
        $crate::__kconf_expect!(fd, $ctx, $call, [] $(, $($msg)+)?)
    };
}

#[macro_export]
macro_rules! expect_fd_silent {
    ($ctx: expr, $call: expr $(, $($msg: tt)+)?) => {
        $crate::__kconf_expect!(fd_silent, $ctx, $call, [] $(, $($msg)+)?)
    };
}

/// Expect `$call` to return a process id.
#[macro_export]
macro_rules! expect_pid {
    ($ctx: expr, $call: expr $(, $($msg: tt)+)?) => {
        $crate::__kconf_expect!(pid, $ctx, $call, [] $(, $($msg)+)?)
    };
}

#[macro_export]
macro_rules! expect_pid_silent {
    ($ctx: expr, $call: expr $(, $($msg: tt)+)?) => {
        $crate::__kconf_expect!(pid_silent, $ctx, $call, [] $(, $($msg)+)?)
    };
}

/// Expect `$call` to return exactly `$expected`.
#[macro_export]
macro_rules! expect_val {
    ($ctx: expr, $call: expr, $expected: expr $(, $($msg: tt)+)?) => {
        $crate::__kconf_expect!(val, $ctx, $call, [($expected) as i64] $(, $($msg)+)?)
    };
}

#[macro_export]
macro_rules! expect_val_silent {
    ($ctx: expr, $call: expr, $expected: expr $(, $($msg: tt)+)?) => {
        $crate::__kconf_expect!(val_silent, $ctx, $call, [($expected) as i64] $(, $($msg)+)?)
    };
}

/// Expect `$call`, which returns `0` on success, to fail with one of `$errnos`.
///
/// `$errnos` is either a single `Errno` or a reference to an array of them.
///
/// ```ignore
/// expect_fail!(ctx, utils::rmdir(&path), Errno::ENOTEMPTY);
/// expect_fail!(ctx, unistd::unlink(&path), &[Errno::EPERM, Errno::EACCES]);
/// ```
#[macro_export]
macro_rules! expect_fail {
    ($ctx: expr, $call: expr, $errnos: expr $(, $($msg: tt)+)?) => {
        $crate::__kconf_expect!(
            fail,
            $ctx,
            $call,
            [
                &$crate::errno::ErrnoSet::from($errnos),
                $crate::expect::Success::Zero
            ]
            $(, $($msg)+)?
        )
    };
}

#[macro_export]
macro_rules! expect_fail_silent {
    ($ctx: expr, $call: expr, $errnos: expr $(, $($msg: tt)+)?) => {
        $crate::__kconf_expect!(
            fail_silent,
            $ctx,
            $call,
            [
                &$crate::errno::ErrnoSet::from($errnos),
                $crate::expect::Success::Zero
            ]
            $(, $($msg)+)?
        )
    };
}

/// Like [`expect_fail!`], for calls which return a non-negative value on success.
#[macro_export]
macro_rules! expect_fail2 {
    ($ctx: expr, $call: expr, $errnos: expr $(, $($msg: tt)+)?) => {
        $crate::__kconf_expect!(
            fail,
            $ctx,
            $call,
            [
                &$crate::errno::ErrnoSet::from($errnos),
                $crate::expect::Success::NonNegative
            ]
            $(, $($msg)+)?
        )
    };
}

#[macro_export]
macro_rules! expect_fail2_silent {
    ($ctx: expr, $call: expr, $errnos: expr $(, $($msg: tt)+)?) => {
        $crate::__kconf_expect!(
            fail_silent,
            $ctx,
            $call,
            [
                &$crate::errno::ErrnoSet::from($errnos),
                $crate::expect::Success::NonNegative
            ]
            $(, $($msg)+)?
        )
    };
}

/// Expect a failure with `$errno` when it is `Some`, a file descriptor otherwise.
#[macro_export]
macro_rules! expect_fd_or_fail {
    ($ctx: expr, $call: expr, $errno: expr $(, $($msg: tt)+)?) => {
        $crate::__kconf_expect!(fd_or_fail, $ctx, $call, [$errno] $(, $($msg)+)?)
    };
}

/// Expect `$call` to return a pointer other than `MAP_FAILED`.
#[macro_export]
macro_rules! expect_pass_ptr_void {
    ($ctx: expr, $call: expr $(, $($msg: tt)+)?) => {
        $crate::__kconf_expect!(
            pass_ptr,
            $ctx,
            $call,
            [$crate::expect::FailPtr::Void]
            $(, $($msg)+)?
        )
    };
}

/// Expect `$call` to return `NULL` with one of `$errnos`.
#[macro_export]
macro_rules! expect_fail_ptr_null {
    ($ctx: expr, $call: expr, $errnos: expr $(, $($msg: tt)+)?) => {
        $crate::__kconf_expect!(
            fail_ptr,
            $ctx,
            $call,
            [
                $crate::expect::FailPtr::Null,
                &$crate::errno::ErrnoSet::from($errnos)
            ]
            $(, $($msg)+)?
        )
    };
}

/// Expect `$call` to return `MAP_FAILED` with one of `$errnos`.
#[macro_export]
macro_rules! expect_fail_ptr_void {
    ($ctx: expr, $call: expr, $errnos: expr $(, $($msg: tt)+)?) => {
        $crate::__kconf_expect!(
            fail_ptr,
            $ctx,
            $call,
            [
                $crate::expect::FailPtr::Void,
                &$crate::errno::ErrnoSet::from($errnos)
            ]
            $(, $($msg)+)?
        )
    };
}

/// Report whether `$expr` holds, as `Expect: <expr>`.
#[macro_export]
macro_rules! expect_expr {
    ($ctx: expr, $expr: expr $(, $($msg: tt)+)?) => {{
        let holds: bool = $expr;
        $crate::expect::expr(
            &$ctx,
            $crate::here!(),
            holds,
            $crate::__kconf_msg!($expr $(, $($msg)+)?),
        )
    }};
}

/// Expect two values to be equal.
#[macro_export]
macro_rules! expect_eq {
    ($ctx: expr, $a: expr, $b: expr $(,)?) => {
        match (&$a, &$b) {
            (a, b) => $crate::expect::eq(
                &$ctx,
                $crate::here!(),
                a,
                stringify!($a),
                b,
                stringify!($b),
            ),
        }
    };
}

#[macro_export]
macro_rules! expect_eq_silent {
    ($ctx: expr, $a: expr, $b: expr $(,)?) => {
        match (&$a, &$b) {
            (a, b) => $crate::expect::eq_silent(
                &$ctx,
                $crate::here!(),
                a,
                stringify!($a),
                b,
                stringify!($b),
            ),
        }
    };
}

/// Expect two strings to be equal.
#[macro_export]
macro_rules! expect_eq_str {
    ($ctx: expr, $a: expr, $b: expr $(,)?) => {
        match (&$a, &$b) {
            (a, b) => $crate::expect::eq_str(
                &$ctx,
                $crate::here!(),
                ::std::convert::AsRef::<str>::as_ref(a),
                stringify!($a),
                ::std::convert::AsRef::<str>::as_ref(b),
                stringify!($b),
            ),
        }
    };
}

/// Expect the first `$len` bytes of two strings to be equal.
#[macro_export]
macro_rules! expect_eq_strn {
    ($ctx: expr, $a: expr, $b: expr, $len: expr $(,)?) => {
        match (&$a, &$b) {
            (a, b) => $crate::expect::eq_strn(
                &$ctx,
                $crate::here!(),
                ::std::convert::AsRef::<str>::as_ref(a),
                stringify!($a),
                ::std::convert::AsRef::<str>::as_ref(b),
                stringify!($b),
                $len,
            ),
        }
    };
}

/// Emit a record of the given kind, optionally qualified with an errno.
///
/// ```ignore
/// report!(ctx, Info, "using {} byte pages", page_size);
/// report!(ctx, Fail, errno = Errno::EAGAIN, "group {group} got no event");
/// ```
#[macro_export]
macro_rules! report {
    ($ctx: expr, $kind: ident, errno = $errno: expr, $($fmt: tt)+) => {
        $crate::result::Report::reporter(&$ctx).report(
            $crate::result::ResultKind::$kind.with_errno(($errno) as i32),
            $crate::here!(),
            format_args!($($fmt)+),
        )
    };
    ($ctx: expr, $kind: ident, $($fmt: tt)+) => {
        $crate::result::Report::reporter(&$ctx).report(
            $crate::result::ResultKind::$kind,
            $crate::here!(),
            format_args!($($fmt)+),
        )
    };
}

/// Abort the run: return a broken [`TestError`](crate::test::TestError).
#[macro_export]
macro_rules! bail_brok {
    (errno = $errno: expr, $($fmt: tt)+) => {
        return Err($crate::test::TestError::broken_errno($errno, format!($($fmt)+)))
    };
    ($($fmt: tt)+) => {
        return Err($crate::test::TestError::broken(format!($($fmt)+)))
    };
}

/// End the current case as not applicable.
#[macro_export]
macro_rules! bail_conf {
    ($($fmt: tt)+) => {
        return Err($crate::test::TestError::conf(format!($($fmt)+)))
    };
}
